//! Ingestion scheduler
//!
//! Runs a fixed set of independent ingestion jobs on a bounded worker pool.
//! Each job runs at most once per run. A failing or panicking job is recorded
//! and never affects its siblings. A ticker logs progress while the run waits
//! for every job to finish.

pub mod jobs;

pub use jobs::{build_jobs, split_statements, IngestJob, IngestTarget, Template};

use crate::config::IngestConfig;
use crate::error::{FleetError, Result};
use crate::executor::RemoteExecutor;
use crate::model::Row;
use polars::prelude::*;
use rand::seq::SliceRandom;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Running, JobState::Succeeded)
                | (JobState::Running, JobState::Failed)
        )
    }
}

/// Shared per-job state for progress reporting
struct JobTracker {
    states: Mutex<Vec<JobState>>,
}

impl JobTracker {
    fn new(total: usize) -> Self {
        Self {
            states: Mutex::new(vec![JobState::Pending; total]),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<JobState>> {
        self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, index: usize, next: JobState) {
        let mut states = self.lock();
        match states.get_mut(index) {
            Some(state) if state.can_transition_to(next) => *state = next,
            Some(state) => warn!("Ignoring job {} transition {:?} -> {:?}", index, state, next),
            None => warn!("Unknown job index {}", index),
        }
    }

    /// (running, done)
    fn counts(&self) -> (usize, usize) {
        let states = self.lock();
        let running = states.iter().filter(|s| **s == JobState::Running).count();
        let done = states.iter().filter(|s| s.is_terminal()).count();
        (running, done)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobFailure {
    pub job: IngestJob,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: String,
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub done: usize,

    /// Jobs that never reached a terminal state (cancelled runs only)
    pub running: usize,
    pub failures: Vec<JobFailure>,

    /// Column sums over the rows of succeeded jobs, numeric columns only
    pub totals: BTreeMap<String, f64>,
    pub elapsed_ms: u64,
}

impl IngestRunSummary {
    /// Failed jobs, ready to be resubmitted
    pub fn failed_jobs(&self) -> Vec<IngestJob> {
        self.failures.iter().map(|f| f.job.clone()).collect()
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed == 0 && self.running == 0 && self.done == self.submitted
    }

    /// Totals as a one-row frame
    pub fn totals_frame(&self) -> Result<DataFrame> {
        let columns = self
            .totals
            .iter()
            .map(|(name, total)| Series::new(name, vec![*total]))
            .collect::<Vec<_>>();
        Ok(DataFrame::new(columns)?)
    }
}

pub struct IngestScheduler {
    executor: Arc<dyn RemoteExecutor>,
    config: IngestConfig,
}

impl IngestScheduler {
    pub fn new(executor: Arc<dyn RemoteExecutor>, config: IngestConfig) -> Self {
        Self { executor, config }
    }

    pub async fn run(&self, jobs: Vec<IngestJob>) -> IngestRunSummary {
        self.run_with_cancel(jobs, &CancellationToken::new()).await
    }

    pub async fn run_with_cancel(
        &self,
        mut jobs: Vec<IngestJob>,
        cancel: &CancellationToken,
    ) -> IngestRunSummary {
        let run_id = Uuid::new_v4().to_string();
        let start = Instant::now();
        if self.config.shuffle {
            jobs.shuffle(&mut rand::thread_rng());
        }
        let total = jobs.len();
        info!("Ingest run {}: {} jobs on {} workers", run_id, total, self.config.max_workers);

        let tracker = Arc::new(JobTracker::new(total));
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut tasks = JoinSet::new();

        for (index, job) in jobs.iter().enumerate() {
            let executor = Arc::clone(&self.executor);
            let semaphore = Arc::clone(&semaphore);
            let tracker = Arc::clone(&tracker);
            let cancel = cancel.clone();
            let call = job.to_call();

            tasks.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return (index, None),
                    permit = semaphore.acquire_owned() => permit,
                };
                let _permit = match permit {
                    Ok(permit) => permit,
                    Err(_) => return (index, None),
                };
                tracker.transition(index, JobState::Running);

                // Inner task so a panic in the executor is caught as this job's failure
                let worker = tokio::spawn(async move { executor.execute(&call).await });
                let abort = worker.abort_handle();
                let joined = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        abort.abort();
                        return (index, None);
                    }
                    joined = worker => joined,
                };
                let outcome = joined
                    .map_err(|e| FleetError::FatalRemote(format!("worker panicked: {}", e)))
                    .and_then(|rows| rows);
                let next = if outcome.is_ok() {
                    JobState::Succeeded
                } else {
                    JobState::Failed
                };
                tracker.transition(index, next);
                (index, Some(outcome))
            });
        }

        let mut outcomes: Vec<Option<Result<Vec<Row>>>> = (0..total).map(|_| None).collect();
        let mut ticker = tokio::time::interval(self.config.progress_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok((index, outcome))) => outcomes[index] = outcome,
                    Some(Err(e)) => error!("Ingest task failed: {}", e),
                    None => break,
                },
                _ = ticker.tick() => {
                    let (running, done) = tracker.counts();
                    info!(
                        "{} running, {} done, {} total, time: {:.1}s",
                        running,
                        done,
                        total,
                        start.elapsed().as_secs_f64()
                    );
                }
            }
        }

        let summary = self.summarize(run_id, &jobs, outcomes, start);
        info!(
            "Ingest run {} done in {:.1}s: {} succeeded, {} failed, {} outstanding",
            summary.run_id,
            start.elapsed().as_secs_f64(),
            summary.succeeded,
            summary.failed,
            summary.running
        );
        debug!("Ingest totals: {:?}", summary.totals);
        summary
    }

    fn summarize(
        &self,
        run_id: String,
        jobs: &[IngestJob],
        outcomes: Vec<Option<Result<Vec<Row>>>>,
        start: Instant,
    ) -> IngestRunSummary {
        let mut totals = NumericTotals::default();
        let mut failures = Vec::new();
        let mut succeeded = 0;

        for (job, outcome) in jobs.iter().zip(outcomes) {
            match outcome {
                Some(Ok(rows)) => {
                    succeeded += 1;
                    rows.iter().for_each(|row| totals.add(row));
                }
                Some(Err(e)) => {
                    let message: String = format!("{} failed with {}", job.label(), e)
                        .chars()
                        .take(self.config.error_excerpt_chars)
                        .collect();
                    error!("{}", message);
                    failures.push(JobFailure {
                        job: job.clone(),
                        message,
                    });
                }
                None => {}
            }
        }

        let failed = failures.len();
        let done = succeeded + failed;
        IngestRunSummary {
            run_id,
            submitted: jobs.len(),
            succeeded,
            failed,
            done,
            running: jobs.len() - done,
            failures,
            totals: totals.finish(),
            elapsed_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Column sums where a column counts only if all its non-null values are numbers
#[derive(Default)]
struct NumericTotals {
    columns: BTreeMap<String, Option<f64>>,
}

impl NumericTotals {
    fn add(&mut self, row: &Row) {
        for (key, value) in row {
            match value {
                Value::Null => {}
                Value::Number(n) => {
                    let entry = self.columns.entry(key.clone()).or_insert(Some(0.0));
                    if let (Some(sum), Some(n)) = (entry.as_mut(), n.as_f64()) {
                        *sum += n;
                    }
                }
                _ => {
                    self.columns.insert(key.clone(), None);
                }
            }
        }
    }

    fn finish(self) -> BTreeMap<String, f64> {
        self.columns
            .into_iter()
            .filter_map(|(key, sum)| sum.map(|sum| (key, sum)))
            .collect()
    }
}
