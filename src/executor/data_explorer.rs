//! Azure Data Explorer executor
//!
//! Sends statements to a cluster's REST endpoint. Management commands (text
//! starting with `.`) go to `/v1/rest/mgmt`, queries to `/v1/rest/query`.
//! The database is fixed per executor, so calls are not scoped by workspace:
//! statements that need a workspace name it in their own text.

use crate::error::{FleetError, Result};
use crate::executor::RemoteExecutor;
use crate::model::{RemoteCall, Row};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct KustoResponse {
    #[serde(rename = "Tables", default)]
    tables: Vec<KustoTable>,
}

#[derive(Debug, Deserialize)]
struct KustoTable {
    #[serde(rename = "Columns", default)]
    columns: Vec<KustoColumn>,
    #[serde(rename = "Rows", default)]
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct KustoColumn {
    #[serde(rename = "ColumnName")]
    name: String,
}

pub struct DataExplorerExecutor {
    cluster: String,
    database: String,
    client: Client,
    timeout: Duration,
    token: Option<String>,
}

impl DataExplorerExecutor {
    pub fn new(cluster: &str, database: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| FleetError::Config(format!("Failed to create HTTP client: {}", e)))?;

        let cluster = cluster.trim_end_matches('/');
        let cluster = if cluster.contains("://") {
            cluster.to_string()
        } else {
            format!("https://{}", cluster)
        };
        Ok(Self {
            cluster,
            database: database.to_string(),
            client,
            timeout,
            token: None,
        })
    }

    /// Executor for a `<cluster url>/<database>` setting
    pub fn from_setting(setting: &str, timeout: Duration) -> Result<Self> {
        let (cluster, database) = split_setting(setting)?;
        Self::new(cluster, database, timeout)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Borrow an access token for the cluster from the local `az` session
    pub async fn with_az_cli_token(self) -> Result<Self> {
        let mut command = Command::new("az");
        command
            .args(["account", "get-access-token", "--resource", self.cluster.as_str()])
            .args(["--query", "accessToken", "-o", "tsv"])
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(FleetError::Config(format!("Failed to launch az: {}", e))),
            Err(_) => return Err(FleetError::Config("az get-access-token timed out".to_string())),
        };
        if !output.status.success() {
            return Err(FleetError::Config(format!(
                "az get-access-token failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(FleetError::Config("az returned an empty access token".to_string()));
        }
        Ok(self.with_token(token))
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// REST endpoint for a statement
    pub fn endpoint(&self, query: &str) -> String {
        if is_command(query) {
            format!("{}/v1/rest/mgmt", self.cluster)
        } else {
            format!("{}/v1/rest/query", self.cluster)
        }
    }

    fn body(&self, query: &str) -> Value {
        json!({ "db": self.database, "csl": query })
    }
}

#[async_trait]
impl RemoteExecutor for DataExplorerExecutor {
    fn name(&self) -> &'static str {
        "data-explorer"
    }

    async fn execute(&self, call: &RemoteCall) -> Result<Vec<Row>> {
        let url = self.endpoint(&call.query);
        debug!("POST {} ({} chars)", url, call.query.len());

        let mut request = self.client.post(&url).json(&self.body(&call.query));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FleetError::TransientRemote(format!("POST {} timed out after {:?}", url, self.timeout))
            } else {
                FleetError::FatalRemote(format!("POST {}: {}", url, e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_failure(status, &text));
        }

        let text = response
            .text()
            .await
            .map_err(|e| FleetError::FatalRemote(format!("POST {}: {}", url, e)))?;
        primary_rows(&text)
    }

    fn describe(&self, call: &RemoteCall) -> String {
        format!(
            "POST {} db={} :: {}",
            self.endpoint(&call.query),
            self.database,
            call.query.replace('\n', " ")
        )
    }
}

/// Split `<cluster url>/<database>` at the last slash
fn split_setting(setting: &str) -> Result<(&str, &str)> {
    match setting.trim().rsplit_once('/') {
        Some((cluster, database))
            if !cluster.is_empty() && !cluster.ends_with([':', '/']) && !database.is_empty() =>
        {
            Ok((cluster, database))
        }
        _ => Err(FleetError::Config(format!(
            "expected <cluster url>/<database>, got {:?}",
            setting
        ))),
    }
}

fn is_command(query: &str) -> bool {
    query.trim_start().starts_with('.')
}

fn status_failure(status: StatusCode, body: &str) -> FleetError {
    let excerpt: String = body.replace('\n', " ").chars().take(300).collect();
    let message = format!("Data Explorer returned {}: {}", status, excerpt.trim());
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => FleetError::TransientRemote(message),
        _ => FleetError::FatalRemote(message),
    }
}

/// Rows of the first table in a v1 response, keyed by column name
fn primary_rows(body: &str) -> Result<Vec<Row>> {
    let response: KustoResponse = serde_json::from_str(body)?;
    let table = match response.tables.into_iter().next() {
        Some(table) => table,
        None => return Ok(Vec::new()),
    };
    Ok(table
        .rows
        .into_iter()
        .map(|values| {
            table
                .columns
                .iter()
                .map(|column| column.name.clone())
                .zip(values)
                .collect::<Map<String, Value>>()
        })
        .collect())
}
