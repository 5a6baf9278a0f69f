mod common;

use common::{ids, row, ScriptedExecutor};
use fleetquery::{
    BatchMode, FanoutConfig, FanoutEngine, FleetError, InlineLoader, QueryRequest, RemoteCall,
    Result, Row, Timespan, WorkspaceId, TENANT_FIELD,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn engine(executor: Arc<ScriptedExecutor>, max_fanout: usize) -> FanoutEngine {
    fanout_engine(executor, max_fanout, 8)
}

fn fanout_engine(
    executor: Arc<ScriptedExecutor>,
    max_fanout: usize,
    fallback_workers: usize,
) -> FanoutEngine {
    FanoutEngine::new(
        executor,
        Arc::new(InlineLoader),
        FanoutConfig {
            max_fanout,
            fallback_workers,
        },
    )
}

/// Fails grouped calls, answers single-workspace calls with one row
fn groups_fail(call: &RemoteCall, _: usize) -> Result<Vec<Row>> {
    if call.targets.len() > 1 {
        return Err(FleetError::FatalRemote("workspace limit".to_string()));
    }
    Ok(vec![row(json!({"Count": 1}))])
}

fn request(workspaces: Vec<WorkspaceId>) -> QueryRequest {
    QueryRequest::new(workspaces, "SecurityIncident | take 20", Timespan::default())
}

#[tokio::test]
async fn test_grouped_success_issues_one_call_per_batch() {
    let executor = Arc::new(ScriptedExecutor::new(|call, _| {
        Ok(call
            .targets
            .iter()
            .map(|ws| row(json!({"TenantId": ws.as_str(), "Count": 1})))
            .collect())
    }));
    let workspaces: Vec<WorkspaceId> = (0..45).map(|i| WorkspaceId::new(format!("ws-{:02}", i))).collect();
    let result = engine(executor.clone(), 20).query(&request(workspaces)).await.unwrap();

    assert_eq!(executor.call_count(), 3);
    assert_eq!(result.rows.len(), 45);
    assert_eq!(result.degraded_batches(), 0);
    assert!(result.failures.is_empty());
    // rows come back in batch order
    assert_eq!(result.rows[0]["TenantId"], json!("ws-00"));
    assert_eq!(result.rows[44]["TenantId"], json!("ws-44"));
}

#[tokio::test]
async fn test_end_to_end_degraded_first_batch() {
    let executor = Arc::new(ScriptedExecutor::new(|call, _| {
        let targets: Vec<&str> = call.targets.iter().map(|t| t.as_str()).collect();
        match targets.as_slice() {
            ["w1", "w2"] => Err(FleetError::FatalRemote("too many workspaces".to_string())),
            ["w1"] => Ok(vec![row(json!({"Title": "a"}))]),
            ["w2"] => Ok(vec![row(json!({"Title": "b"}))]),
            ["w3"] => Ok(vec![row(json!({"Title": "c"})), row(json!({"Title": "d"}))]),
            other => panic!("unexpected call {:?}", other),
        }
    }));

    let result = engine(executor.clone(), 2)
        .query(&request(ids(&["w3", "w2", "w1"])))
        .await
        .unwrap();

    assert_eq!(result.rows.len(), 4);
    assert_eq!(result.rows[0][TENANT_FIELD], json!("w1"));
    assert_eq!(result.rows[1][TENANT_FIELD], json!("w2"));
    assert!(result.rows[2].get(TENANT_FIELD).is_none());
    assert!(result.rows[3].get(TENANT_FIELD).is_none());
    assert_eq!(result.rows[2]["Title"], json!("c"));

    assert_eq!(result.batches.len(), 2);
    assert_eq!(result.batches[0].mode, BatchMode::Fallback);
    assert_eq!(result.batches[1].mode, BatchMode::Grouped);
    assert_eq!(executor.call_count(), 4);
}

#[tokio::test]
async fn test_failing_workspace_only_degrades_its_batch() {
    let executor = Arc::new(ScriptedExecutor::new(|call, _| {
        if call.targets.iter().any(|t| t.as_str() == "bad") {
            return Err(FleetError::FatalRemote("unknown workspace".to_string()));
        }
        Ok(call.targets.iter().map(|_| row(json!({"Count": 1}))).collect())
    }));

    let result = engine(executor.clone(), 2)
        .query(&request(ids(&["a", "bad", "c", "d"])))
        .await
        .unwrap();

    // batches: [a, bad], [c, d]
    assert_eq!(result.batches[0].mode, BatchMode::Fallback);
    assert_eq!(result.batches[1].mode, BatchMode::Grouped);
    assert_eq!(result.rows.len(), 3);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].workspace, WorkspaceId::from("bad"));
    assert!(!result.failures[0].transient);
    // grouped [a,bad], then a, bad individually, then grouped [c,d]
    assert_eq!(executor.call_count(), 4);
}

#[tokio::test]
async fn test_post_filter_and_timespan_reach_executor() {
    let executor = Arc::new(ScriptedExecutor::new(|_, _| Ok(Vec::new())));
    let req = QueryRequest::new(ids(&["w1"]), "Heartbeat", Timespan::parse("PT1H").unwrap())
        .with_post_filter("[].TenantId");
    let result = engine(executor.clone(), 20).query(&req).await.unwrap();

    assert!(result.is_empty());
    let calls = executor.calls();
    assert_eq!(calls[0].timespan.as_ref().map(|t| t.as_str()), Some("PT1H"));
    assert_eq!(calls[0].post_filter.as_deref(), Some("[].TenantId"));
}

#[tokio::test]
async fn test_empty_workspace_set_makes_no_calls() {
    let executor = Arc::new(ScriptedExecutor::new(|_, _| Ok(Vec::new())));
    let result = engine(executor.clone(), 20).query(&request(Vec::new())).await.unwrap();
    assert!(result.rows.is_empty());
    assert!(result.batches.is_empty());
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test]
async fn test_fallback_respects_worker_limit() {
    let executor = Arc::new(ScriptedExecutor::new(groups_fail).with_delay(Duration::from_millis(20)));
    let workspaces = ids(&["w1", "w2", "w3", "w4", "w5", "w6"]);
    let result = fanout_engine(executor.clone(), 20, 2)
        .query(&request(workspaces))
        .await
        .unwrap();

    assert_eq!(result.batches[0].mode, BatchMode::Fallback);
    assert_eq!(result.rows.len(), 6);
    let tenants: Vec<&str> = result
        .rows
        .iter()
        .filter_map(|r| r[TENANT_FIELD].as_str())
        .collect();
    assert_eq!(tenants, vec!["w1", "w2", "w3", "w4", "w5", "w6"]);
    assert_eq!(executor.peak(), 2);
    assert_eq!(executor.call_count(), 7);
}

#[tokio::test]
async fn test_cancel_during_fallback_stops_remaining_calls() {
    let executor = Arc::new(ScriptedExecutor::new(groups_fail).with_delay(Duration::from_millis(50)));
    let engine = fanout_engine(executor.clone(), 20, 2);
    let token = CancellationToken::new();

    // cancel once the grouped call and the first two fallback calls have started
    let watcher = {
        let executor = executor.clone();
        let token = token.clone();
        tokio::spawn(async move {
            while executor.call_count() < 3 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            token.cancel();
        })
    };

    let workspaces: Vec<WorkspaceId> = (0..10).map(|i| WorkspaceId::new(format!("ws-{}", i))).collect();
    let err = engine
        .query_with_cancel(&request(workspaces), &token)
        .await
        .unwrap_err();
    watcher.await.unwrap();

    assert!(err.is_cancelled());
    let at_cancel = executor.call_count();
    assert_eq!(at_cancel, 3);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(executor.call_count(), at_cancel);
}
