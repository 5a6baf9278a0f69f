mod common;

use common::{row, ScriptedExecutor};
use fleetquery::{
    build_jobs, FleetError, IngestConfig, IngestJob, IngestScheduler, IngestTarget, Template,
    WorkspaceDetails, WorkspaceId,
};
use serde_json::json;
use std::sync::Arc;

fn config() -> IngestConfig {
    IngestConfig {
        progress_interval_ms: 10,
        ..IngestConfig::default()
    }
}

#[tokio::test]
async fn test_failures_are_isolated_and_counted() {
    let executor = Arc::new(ScriptedExecutor::new(|call, _| {
        if call.query.starts_with("broken") {
            Err(FleetError::FatalRemote("semantic error".to_string()))
        } else {
            Ok(vec![row(json!({"ExtentCount": 1, "RowCount": 100, "Table": "x"}))])
        }
    }));
    let mut jobs: Vec<IngestJob> = (0..17)
        .map(|i| IngestJob::for_workspace(format!("ingest {}", i), WorkspaceId::new(format!("w{}", i))))
        .collect();
    for i in 0..3 {
        jobs.push(IngestJob::global(format!("broken {}", i)));
    }

    let summary = IngestScheduler::new(executor.clone(), config()).run(jobs).await;

    assert_eq!(executor.call_count(), 20);
    assert_eq!(summary.submitted, 20);
    assert_eq!(summary.failed, 3);
    assert_eq!(summary.succeeded, 17);
    assert_eq!(summary.done, 20);
    assert_eq!(summary.totals.get("RowCount"), Some(&1700.0));
    assert_eq!(summary.totals.get("ExtentCount"), Some(&17.0));
    assert!(summary.failures.iter().all(|f| f.message.contains("failed with")));

    let retry: Vec<IngestJob> = summary.failed_jobs();
    assert_eq!(retry.len(), 3);
    assert!(retry.iter().all(|job| job.target == IngestTarget::Global));
}

#[tokio::test]
async fn test_each_job_runs_once() {
    let executor = Arc::new(ScriptedExecutor::new(|_, _| Ok(Vec::new())));
    let details = vec![
        WorkspaceDetails::new("aaa-1", "/ws/a", "a"),
        WorkspaceDetails::new("bbb-2", "/ws/b", "b"),
        WorkspaceDetails::new("ccc-3", "/ws/c", "c"),
    ];
    let template = Template::new(".append ${ingest_function} <| T1\n\n.append ${ingest_function} <| T2");
    let jobs = build_jobs(".set-or-append Global <| Heartbeat", &template, &details).unwrap();
    assert_eq!(jobs.len(), 7);

    let summary = IngestScheduler::new(executor.clone(), config()).run(jobs.clone()).await;
    assert!(summary.is_complete_success());
    assert!(summary.totals.is_empty());

    let mut seen: Vec<String> = executor.calls().into_iter().map(|c| c.query).collect();
    let mut expected: Vec<String> = jobs.into_iter().map(|j| j.query).collect();
    seen.sort();
    expected.sort();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_empty_job_set() {
    let executor = Arc::new(ScriptedExecutor::new(|_, _| Ok(Vec::new())));
    let summary = IngestScheduler::new(executor, config()).run(Vec::new()).await;
    assert_eq!(summary.submitted, 0);
    assert!(summary.is_complete_success());
}
