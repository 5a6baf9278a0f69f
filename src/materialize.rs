//! Retrying materializer
//!
//! Turns a fan-out query into a typed `DataFrame`. Timeout-class outcomes are
//! retried with linear backoff; empty and failed outcomes are reported as
//! distinct variants instead of errors.

use crate::config::RetryPolicy;
use crate::error::{FleetError, Result};
use crate::fanout::FanoutEngine;
use crate::model::{leading_table, QueryRequest, Row, Timespan, WorkspaceId};
use polars::prelude::*;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const PLACEHOLDER_PREFIX: &str = "No Data in timespan ";

#[derive(Debug, Clone)]
pub enum Materialized {
    Data(DataFrame),
    /// The query succeeded and returned no rows
    Empty { table: String, timespan: Timespan },
    /// The query failed with a non-retryable error
    Failed {
        table: String,
        timespan: Timespan,
        error: String,
    },
}

impl Materialized {
    pub fn is_data(&self) -> bool {
        matches!(self, Materialized::Data(_))
    }

    /// Frame for callers that expect a table in every case. `Empty` and
    /// `Failed` become the single-cell placeholder table.
    pub fn into_table(self) -> Result<DataFrame> {
        match self {
            Materialized::Data(df) => Ok(df),
            Materialized::Empty { table, timespan } | Materialized::Failed { table, timespan, .. } => {
                placeholder_table(&table, &timespan)
            }
        }
    }
}

/// One column named `table` holding `No Data in timespan <timespan>`
pub fn placeholder_table(table: &str, timespan: &Timespan) -> Result<DataFrame> {
    let message = format!("{}{}", PLACEHOLDER_PREFIX, timespan);
    Ok(DataFrame::new(vec![Series::new(table, vec![message])])?)
}

pub fn is_placeholder(df: &DataFrame) -> bool {
    if df.width() != 1 || df.height() != 1 {
        return false;
    }
    df.get_columns()[0]
        .str()
        .ok()
        .and_then(|values| values.get(0))
        .map(|value| value.starts_with(PLACEHOLDER_PREFIX))
        .unwrap_or(false)
}

pub struct RetryingMaterializer {
    engine: Arc<FanoutEngine>,
    policy: RetryPolicy,
}

impl RetryingMaterializer {
    pub fn new(engine: Arc<FanoutEngine>, policy: RetryPolicy) -> Self {
        Self { engine, policy }
    }

    pub async fn materialize(
        &self,
        query: &str,
        timespan: &Timespan,
        workspaces: &[WorkspaceId],
    ) -> Result<Materialized> {
        self.materialize_with_cancel(query, timespan, workspaces, &CancellationToken::new())
            .await
    }

    pub async fn materialize_with_cancel(
        &self,
        query: &str,
        timespan: &Timespan,
        workspaces: &[WorkspaceId],
        cancel: &CancellationToken,
    ) -> Result<Materialized> {
        let table = leading_table(query);
        let request = QueryRequest::new(workspaces.to_vec(), query, timespan.clone());
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            let transient = match self.engine.query_with_cancel(&request, cancel).await {
                Ok(result) if !result.rows.is_empty() => {
                    let df = rows_to_frame(&result.rows)?;
                    info!("Materialized {} rows x {} columns for {}", df.height(), df.width(), table);
                    return Ok(Materialized::Data(df));
                }
                Ok(result) if result.transient_failure() => result
                    .failures
                    .iter()
                    .map(|f| format!("{}: {}", f.workspace, f.message))
                    .collect::<Vec<_>>()
                    .join("; "),
                Ok(result) if result.failures.is_empty() => {
                    warn!("No data for {} in {} workspaces", table, workspaces.len());
                    return Ok(Materialized::Empty {
                        table,
                        timespan: timespan.clone(),
                    });
                }
                Ok(result) => {
                    let error = result
                        .failures
                        .iter()
                        .map(|f| format!("{}: {}", f.workspace, f.message))
                        .collect::<Vec<_>>()
                        .join("; ");
                    warn!("{}: No data for {}", error, table);
                    return Ok(Materialized::Failed {
                        table,
                        timespan: timespan.clone(),
                        error,
                    });
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if e.is_transient() => e.to_string(),
                Err(e) => {
                    warn!("{}: No data for {}", e, table);
                    return Ok(Materialized::Failed {
                        table,
                        timespan: timespan.clone(),
                        error: e.to_string(),
                    });
                }
            };

            attempt += 1;
            if attempt >= max_attempts {
                return Err(FleetError::TransientRemote(format!(
                    "{} after {} attempts: {}",
                    table, attempt, transient
                )));
            }

            let delay = self.policy.delay_for(attempt - 1);
            warn!(
                "Timeout: {}, retrying in {:?} (attempt {}/{})",
                transient,
                delay,
                attempt + 1,
                max_attempts
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(FleetError::Cancelled("materialize cancelled".to_string()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Flatten nested objects one level (`a.b`) and build a frame with one
/// inferred type per column.
pub fn rows_to_frame(rows: &[Row]) -> Result<DataFrame> {
    let flat: Vec<Vec<(String, Value)>> = rows.iter().map(flatten_row).collect();

    let mut columns: Vec<String> = Vec::new();
    for row in &flat {
        for (key, _) in row {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }

    let series = columns
        .iter()
        .map(|column| {
            let values: Vec<Option<&Value>> = flat
                .iter()
                .map(|row| {
                    row.iter()
                        .find(|(key, _)| key == column)
                        .map(|(_, value)| value)
                        .filter(|value| !value.is_null())
                })
                .collect();
            column_series(column, &values)
        })
        .collect::<Vec<_>>();

    Ok(DataFrame::new(series)?)
}

fn flatten_row(row: &Row) -> Vec<(String, Value)> {
    let mut out = Vec::with_capacity(row.len());
    for (key, value) in row {
        match value {
            Value::Object(inner) => {
                for (inner_key, inner_value) in inner {
                    out.push((format!("{}.{}", key, inner_key), nested_value(inner_value)));
                }
            }
            other => out.push((key.clone(), nested_value(other))),
        }
    }
    out
}

fn nested_value(value: &Value) -> Value {
    match value {
        Value::Object(_) | Value::Array(_) => Value::String(value.to_string()),
        other => other.clone(),
    }
}

fn column_series(name: &str, values: &[Option<&Value>]) -> Series {
    let present = || values.iter().flatten();

    if present().all(|v| v.is_i64()) {
        let data: Vec<Option<i64>> = values.iter().map(|v| v.and_then(Value::as_i64)).collect();
        return Series::new(name, data);
    }
    if present().all(|v| v.is_number()) {
        let data: Vec<Option<f64>> = values.iter().map(|v| v.and_then(Value::as_f64)).collect();
        return Series::new(name, data);
    }
    if present().all(|v| v.is_boolean()) {
        let data: Vec<Option<bool>> = values.iter().map(|v| v.and_then(Value::as_bool)).collect();
        return Series::new(name, data);
    }
    let data: Vec<Option<String>> = values
        .iter()
        .map(|v| {
            v.map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        })
        .collect();
    Series::new(name, data)
}
