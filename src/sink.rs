//! Result archival
//!
//! Rows are written one file per row under
//! `<prefix>/<date>/<key values joined by _>.json`, where `<date>` is the date
//! part of the row's timestamp field.

use crate::error::{FleetError, Result};
use crate::model::Row;
use crate::paths::clean_path;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Concurrent writers used by `archive_rows`
pub const DEFAULT_ARCHIVE_WORKERS: usize = 32;

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn put(&self, path: &str, row: &Row) -> Result<()>;
}

/// Archive location for `row`
pub fn archive_path(prefix: &str, row: &Row, date_field: &str, keys: &[String]) -> Result<String> {
    let timestamp = row
        .get(date_field)
        .and_then(Value::as_str)
        .ok_or_else(|| FleetError::Sink(format!("row has no string field {}", date_field)))?;
    let date = timestamp.split('T').next().unwrap_or(timestamp);

    let mut parts = Vec::with_capacity(keys.len());
    for key in keys {
        let value = row
            .get(key)
            .ok_or_else(|| FleetError::Sink(format!("row has no field {}", key)))?;
        parts.push(value_text(value));
    }
    if parts.is_empty() {
        return Err(FleetError::Sink("at least one filename key is required".to_string()));
    }

    Ok(clean_path(&format!("{}/{}/{}.json", prefix, date, parts.join("_"))))
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Writes rows as pretty-printed JSON files below a local root directory
pub struct LocalJsonSink {
    root: PathBuf,

    /// Timestamp field compared against an existing file before overwriting
    modified_key: Option<String>,
}

impl LocalJsonSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            modified_key: None,
        }
    }

    pub fn with_modified_key(mut self, key: impl Into<String>) -> Self {
        self.modified_key = Some(key.into());
        self
    }

    /// Whether `row` is not newer than what is already stored at `target`
    async fn is_stale(&self, target: &Path, row: &Row) -> Result<bool> {
        let key = match &self.modified_key {
            Some(key) => key,
            None => return Ok(false),
        };
        if !tokio::fs::try_exists(target).await? {
            return Ok(false);
        }
        let existing: Row = serde_json::from_str(&tokio::fs::read_to_string(target).await?)?;
        let source = row.get(key).and_then(Value::as_str).and_then(parse_timestamp);
        let dest = existing.get(key).and_then(Value::as_str).and_then(parse_timestamp);
        match (source, dest) {
            (Some(source), Some(dest)) => Ok(source <= dest),
            _ => Ok(false),
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw).ok()
}

#[async_trait]
impl ResultSink for LocalJsonSink {
    async fn put(&self, path: &str, row: &Row) -> Result<()> {
        let target = self.root.join(clean_path(path));
        if self.is_stale(&target, row).await? {
            debug!("{} is up to date, skipping", target.display());
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_string_pretty(row)?;
        tokio::fs::write(&target, body).await?;
        Ok(())
    }
}

/// Write every row to `sink` with up to `workers` concurrent puts.
///
/// Path derivation errors abort before anything is written. Individual put
/// failures are logged and left out of the returned count.
pub async fn archive_rows(
    sink: Arc<dyn ResultSink>,
    rows: Vec<Row>,
    prefix: &str,
    date_field: &str,
    keys: &[String],
    workers: usize,
) -> Result<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    let prefix = clean_path(prefix);
    let planned = rows
        .into_iter()
        .map(|row| archive_path(&prefix, &row, date_field, keys).map(|path| (path, row)))
        .collect::<Result<Vec<_>>>()?;

    let total = planned.len();
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = JoinSet::new();
    for (path, row) in planned {
        let sink = Arc::clone(&sink);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| FleetError::Sink(e.to_string()))?;
            sink.put(&path, &row).await.map_err(|e| {
                warn!("Failed to archive {}: {}", path, e);
                e
            })
        });
    }

    let mut written = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => written += 1,
            Ok(Err(_)) => {}
            Err(e) => warn!("Archive task failed: {}", e),
        }
    }
    debug!("Archived {}/{} rows under {}", written, total, prefix);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_archive_path() {
        let incident = row(json!({
            "TimeGenerated": "2024-03-01T10:15:00Z",
            "TenantId": "w1",
            "IncidentNumber": 42
        }));
        let keys = vec!["TenantId".to_string(), "IncidentNumber".to_string()];
        let path = archive_path("/incidents/", &incident, "TimeGenerated", &keys).unwrap();
        assert_eq!(path, "incidents/2024-03-01/w1_42.json");

        let missing = vec!["Severity".to_string()];
        assert!(archive_path("incidents", &incident, "TimeGenerated", &missing).is_err());
    }

    #[tokio::test]
    async fn test_local_sink_skips_older_rows() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LocalJsonSink::new(dir.path()).with_modified_key("TimeGenerated");

        let newer = row(json!({"TimeGenerated": "2024-03-01T12:00:00Z", "Status": "Closed"}));
        let older = row(json!({"TimeGenerated": "2024-03-01T09:00:00Z", "Status": "New"}));

        sink.put("a/b.json", &newer).await.unwrap();
        sink.put("a/b.json", &older).await.unwrap();

        let stored: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("a/b.json")).unwrap()).unwrap();
        assert_eq!(stored["Status"], json!("Closed"));
    }

    #[tokio::test]
    async fn test_archive_rows_writes_each_row() {
        let dir = tempfile::tempdir().unwrap();
        let sink: Arc<dyn ResultSink> = Arc::new(LocalJsonSink::new(dir.path()));
        let rows = vec![
            row(json!({"TimeGenerated": "2024-03-01T10:00:00Z", "TenantId": "w1"})),
            row(json!({"TimeGenerated": "2024-03-02T10:00:00Z", "TenantId": "w2"})),
        ];
        let keys = vec!["TenantId".to_string()];
        let written = archive_rows(sink, rows, "out", "TimeGenerated", &keys, DEFAULT_ARCHIVE_WORKERS)
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert!(dir.path().join("out/2024-03-01/w1.json").exists());
        assert!(dir.path().join("out/2024-03-02/w2.json").exists());
    }
}
