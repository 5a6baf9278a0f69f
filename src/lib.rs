//! fleetquery - fan-out query and ingestion orchestration over a fleet of
//! remotely hosted log workspaces.

pub mod batcher;
pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod fanout;
pub mod format;
pub mod loader;
pub mod materialize;
pub mod model;
pub mod observability;
pub mod paths;
pub mod scheduler;
pub mod sink;
pub mod workspaces;

pub use batcher::{batch_count, batches, Batch};
pub use cache::{CachedExecutor, MemoCache};
pub use config::{FanoutConfig, IngestConfig, RetryPolicy, Settings};
pub use error::{FleetError, Result};
pub use executor::{AzCliExecutor, DataExplorerExecutor, RemoteExecutor};
pub use fanout::{BatchMode, BatchOutcome, FanoutEngine, QueryResult, WorkspaceFailure};
pub use format::OutputFormat;
pub use loader::{InlineLoader, KqlLoader, QueryLoader};
pub use materialize::{is_placeholder, placeholder_table, Materialized, RetryingMaterializer};
pub use model::{QueryRequest, RemoteCall, Row, Timespan, WorkspaceId, TENANT_FIELD};
pub use scheduler::{
    build_jobs, IngestJob, IngestRunSummary, IngestScheduler, IngestTarget, JobFailure, JobState,
    Template,
};
pub use sink::{archive_path, archive_rows, LocalJsonSink, ResultSink};
pub use workspaces::{WorkspaceDetails, WorkspaceDirectory, WorkspaceRecord};
