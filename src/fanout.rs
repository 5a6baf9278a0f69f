//! Fan-out query engine
//!
//! Runs one logical query over a workspace fleet. Each batch is tried as one
//! grouped call first; when that call fails the batch degrades to one call per
//! workspace, run concurrently under a semaphore. Workspace and batch failures
//! never fail the query, they are reported in the result instead.

use crate::batcher::{batches, Batch};
use crate::config::FanoutConfig;
use crate::error::{FleetError, Result};
use crate::executor::RemoteExecutor;
use crate::loader::{InlineLoader, QueryLoader};
use crate::model::{tag_rows, QueryRequest, RemoteCall, Row, WorkspaceId};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchMode {
    /// One call named every workspace of the batch
    Grouped,
    /// The grouped call failed and each workspace was queried on its own
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub index: usize,
    pub workspaces: Batch,
    pub mode: BatchMode,
    pub rows: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceFailure {
    pub workspace: WorkspaceId,
    pub transient: bool,
    pub message: String,
}

/// Merged output of one fan-out query
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResult {
    /// Rows in batch order; fallback rows in workspace order within a batch
    pub rows: Vec<Row>,
    pub batches: Vec<BatchOutcome>,
    pub failures: Vec<WorkspaceFailure>,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn degraded_batches(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| b.mode == BatchMode::Fallback)
            .count()
    }

    /// True when nothing came back and every recorded failure was a timeout
    pub fn transient_failure(&self) -> bool {
        self.rows.is_empty()
            && !self.failures.is_empty()
            && self.failures.iter().all(|f| f.transient)
    }
}

struct BatchRun {
    outcome: BatchOutcome,
    rows: Vec<Row>,
    failures: Vec<WorkspaceFailure>,
}

pub struct FanoutEngine {
    executor: Arc<dyn RemoteExecutor>,
    loader: Arc<dyn QueryLoader>,
    config: FanoutConfig,
}

impl FanoutEngine {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        loader: Arc<dyn QueryLoader>,
        config: FanoutConfig,
    ) -> Self {
        Self {
            executor,
            loader,
            config,
        }
    }

    /// Engine over inline query text with default limits
    pub fn with_executor(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self::new(executor, Arc::new(InlineLoader), FanoutConfig::default())
    }

    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResult> {
        self.query_with_cancel(request, &CancellationToken::new()).await
    }

    pub async fn query_with_cancel(
        &self,
        request: &QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryResult> {
        let start = Instant::now();
        let query = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            loaded = self.loader.load(&request.query) => loaded?,
        };
        let planned = batches(request.workspaces.iter().cloned(), self.config.max_fanout)?;
        info!(
            "Querying {} workspaces in {} batches via {}",
            request.workspaces.len(),
            planned.len(),
            self.executor.name()
        );

        let mut result = QueryResult::default();
        for (index, batch) in planned.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            let call = RemoteCall {
                query: query.clone(),
                targets: batch,
                timespan: Some(request.timespan.clone()),
                post_filter: request.post_filter.clone(),
            };
            let run = self.run_batch(index, call, request.group_first, cancel).await?;
            result.rows.extend(run.rows);
            result.failures.extend(run.failures);
            result.batches.push(run.outcome);
        }

        info!(
            "Query returned {} rows ({} degraded batches, {} failed workspaces) in {}ms",
            result.rows.len(),
            result.degraded_batches(),
            result.failures.len(),
            start.elapsed().as_millis()
        );
        Ok(result)
    }

    /// Grouped calls that `query` would issue, rendered by the executor
    pub async fn dry_run(&self, request: &QueryRequest) -> Result<Vec<String>> {
        let query = self.loader.load(&request.query).await?;
        let planned = batches(request.workspaces.iter().cloned(), self.config.max_fanout)?;
        Ok(planned
            .into_iter()
            .map(|batch| {
                let call = RemoteCall {
                    query: query.clone(),
                    targets: batch,
                    timespan: Some(request.timespan.clone()),
                    post_filter: request.post_filter.clone(),
                };
                self.executor.describe(&call)
            })
            .collect())
    }

    async fn run_batch(
        &self,
        index: usize,
        call: RemoteCall,
        group_first: bool,
        cancel: &CancellationToken,
    ) -> Result<BatchRun> {
        if group_first || call.targets.len() == 1 {
            let grouped = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                rows = self.executor.execute(&call) => rows,
            };
            match grouped {
                Ok(rows) => {
                    debug!("Batch {} returned {} rows", index, rows.len());
                    return Ok(BatchRun {
                        outcome: BatchOutcome {
                            index,
                            workspaces: call.targets,
                            mode: BatchMode::Grouped,
                            rows: rows.len(),
                            failed: 0,
                        },
                        rows,
                        failures: Vec::new(),
                    });
                }
                Err(e) if call.targets.len() == 1 => {
                    warn!("Workspace {} failed: {}", call.targets[0], e);
                    let failure = WorkspaceFailure {
                        workspace: call.targets[0].clone(),
                        transient: e.is_transient(),
                        message: e.to_string(),
                    };
                    return Ok(BatchRun {
                        outcome: BatchOutcome {
                            index,
                            workspaces: call.targets,
                            mode: BatchMode::Grouped,
                            rows: 0,
                            failed: 1,
                        },
                        rows: Vec::new(),
                        failures: vec![failure],
                    });
                }
                Err(e) => {
                    warn!("{}: falling back to individual queries for batch {}", e, index);
                }
            }
        }

        self.fallback(index, call, cancel).await
    }

    async fn fallback(
        &self,
        index: usize,
        call: RemoteCall,
        cancel: &CancellationToken,
    ) -> Result<BatchRun> {
        let semaphore = Arc::new(Semaphore::new(self.config.fallback_workers.max(1)));
        let mut tasks = JoinSet::new();

        for (position, workspace) in call.targets.iter().enumerate() {
            let executor = Arc::clone(&self.executor);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let single = call.for_workspace(workspace);
            tasks.spawn(async move {
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(cancelled()),
                    outcome = async {
                        match semaphore.acquire_owned().await {
                            Ok(_permit) => executor.execute(&single).await,
                            Err(e) => Err(FleetError::FatalRemote(e.to_string())),
                        }
                    } => outcome,
                };
                (position, outcome)
            });
        }

        let mut outcomes: Vec<Option<Result<Vec<Row>>>> =
            (0..call.targets.len()).map(|_| None).collect();
        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(cancelled());
                }
                joined = tasks.join_next() => joined,
            };
            match joined {
                Some(Ok((position, outcome))) => outcomes[position] = Some(outcome),
                Some(Err(e)) => warn!("Fallback worker for batch {} failed: {}", index, e),
                None => break,
            }
        }
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        // Merge in workspace order, whatever order the calls finished in.
        let mut rows = Vec::new();
        let mut failures = Vec::new();
        for (workspace, outcome) in call.targets.iter().zip(outcomes) {
            let outcome = outcome.unwrap_or_else(|| {
                Err(FleetError::FatalRemote("worker stopped without a result".to_string()))
            });
            match outcome {
                Ok(mut workspace_rows) => {
                    tag_rows(&mut workspace_rows, workspace);
                    rows.extend(workspace_rows);
                }
                Err(e) => {
                    warn!("Workspace {} failed: {}", workspace, e);
                    failures.push(WorkspaceFailure {
                        workspace: workspace.clone(),
                        transient: e.is_transient(),
                        message: e.to_string(),
                    });
                }
            }
        }

        Ok(BatchRun {
            outcome: BatchOutcome {
                index,
                workspaces: call.targets,
                mode: BatchMode::Fallback,
                rows: rows.len(),
                failed: failures.len(),
            },
            rows,
            failures,
        })
    }
}

fn cancelled() -> FleetError {
    FleetError::Cancelled("fan-out query cancelled".to_string())
}
