//! Remote Executor - the single seam to the query backend
//!
//! The backend runs one query string against a list of workspaces within a
//! time budget. Implementations classify timeouts as
//! `FleetError::TransientRemote`; every other failure is fatal to the core.

pub mod az_cli;
pub mod data_explorer;

use crate::error::Result;
use crate::model::{RemoteCall, Row};
use async_trait::async_trait;

pub use az_cli::AzCliExecutor;
pub use data_explorer::DataExplorerExecutor;

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Backend name (e.g., "az-cli")
    fn name(&self) -> &'static str;

    /// Run one physical call and return its rows
    async fn execute(&self, call: &RemoteCall) -> Result<Vec<Row>>;

    /// Human-readable rendering of a call, used for dry runs
    fn describe(&self, call: &RemoteCall) -> String {
        let targets: Vec<&str> = call.targets.iter().map(|t| t.as_str()).collect();
        format!(
            "{} [{}] timespan={} :: {}",
            self.name(),
            targets.join(","),
            call.timespan.as_ref().map(|t| t.as_str()).unwrap_or("-"),
            call.query.replace('\n', " ")
        )
    }
}
