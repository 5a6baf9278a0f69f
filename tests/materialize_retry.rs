mod common;

use common::{ids, row, ScriptedExecutor};
use fleetquery::{
    is_placeholder, FanoutEngine, FleetError, Materialized, RetryPolicy, RetryingMaterializer,
    Timespan,
};
use serde_json::json;
use std::sync::Arc;

fn materializer(executor: Arc<ScriptedExecutor>) -> RetryingMaterializer {
    let engine = Arc::new(FanoutEngine::with_executor(executor));
    RetryingMaterializer::new(engine, RetryPolicy::immediate(5))
}

#[tokio::test]
async fn test_transient_failures_are_retried_until_data() {
    for k in 0..5 {
        let executor = Arc::new(ScriptedExecutor::new(move |_, seq| {
            if seq < k {
                Err(FleetError::TransientRemote("read timed out".to_string()))
            } else {
                Ok(vec![row(json!({"Count": 7}))])
            }
        }));
        let outcome = materializer(executor.clone())
            .materialize("SecurityIncident | count", &Timespan::default(), &ids(&["w1"]))
            .await
            .unwrap();

        assert!(outcome.is_data());
        assert_eq!(executor.call_count(), k + 1, "k = {}", k);
    }
}

#[tokio::test]
async fn test_always_transient_gives_up_after_five_attempts() {
    let executor = Arc::new(ScriptedExecutor::new(|_, _| {
        Err(FleetError::TransientRemote("read timed out".to_string()))
    }));
    let err = materializer(executor.clone())
        .materialize("SigninLogs", &Timespan::default(), &ids(&["w1"]))
        .await
        .unwrap_err();

    assert!(err.is_transient());
    assert_eq!(executor.call_count(), 5);
}

#[tokio::test]
async fn test_empty_result_names_leading_table() {
    let executor = Arc::new(ScriptedExecutor::new(|_, _| Ok(Vec::new())));
    let timespan = Timespan::parse("P1D").unwrap();
    let outcome = materializer(executor.clone())
        .materialize("AuditLogs\n| where OperationName has 'role'", &timespan, &ids(&["w1", "w2"]))
        .await
        .unwrap();

    match &outcome {
        Materialized::Empty { table, timespan } => {
            assert_eq!(table, "AuditLogs");
            assert_eq!(timespan.as_str(), "P1D");
        }
        other => panic!("expected empty outcome, got {:?}", other),
    }
    assert_eq!(executor.call_count(), 1);

    let df = outcome.into_table().unwrap();
    assert!(is_placeholder(&df));
    let cell = df.column("AuditLogs").unwrap().str().unwrap().get(0).map(str::to_string);
    assert_eq!(cell.as_deref(), Some("No Data in timespan P1D"));
}

#[tokio::test]
async fn test_fatal_failure_is_not_retried() {
    let executor = Arc::new(ScriptedExecutor::new(|_, _| {
        Err(FleetError::FatalRemote("unknown workspace".to_string()))
    }));
    let outcome = materializer(executor.clone())
        .materialize("Heartbeat", &Timespan::default(), &ids(&["w1"]))
        .await
        .unwrap();

    assert!(matches!(outcome, Materialized::Failed { .. }));
    assert_eq!(executor.call_count(), 1);
}

#[tokio::test]
async fn test_data_frame_has_merged_rows() {
    let executor = Arc::new(ScriptedExecutor::new(|call, _| {
        if call.targets.len() > 1 {
            return Err(FleetError::FatalRemote("limit".to_string()));
        }
        Ok(vec![row(json!({"Count": 2, "Entity": {"Kind": "host"}}))])
    }));
    let outcome = materializer(executor)
        .materialize("SecurityAlert", &Timespan::default(), &ids(&["w1", "w2"]))
        .await
        .unwrap();

    let df = outcome.into_table().unwrap();
    assert_eq!(df.height(), 2);
    assert!(df.column("Entity.Kind").is_ok());
    assert!(df.column("TenantId").is_ok());
}
