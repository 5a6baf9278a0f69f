//! Core data model shared by the fan-out engine, materializer and scheduler

use crate::error::{FleetError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Field stamped on rows obtained through per-workspace fallback calls
pub const TENANT_FIELD: &str = "TenantId";

/// One result record: field name to heterogeneous value
pub type Row = Map<String, Value>;

lazy_static::lazy_static! {
    static ref ISO_DURATION: Regex = Regex::new(
        r"^P(\d+Y)?(\d+M)?(\d+W)?(\d+D)?(T(\d+H)?(\d+M)?(\d+(\.\d+)?S)?)?$"
    ).expect("duration pattern is valid");
}

/// Opaque identifier of one remote log datastore
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkspaceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for WorkspaceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// ISO-8601 duration such as `P7D` or `PT1H`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timespan(String);

impl Timespan {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let shaped = ISO_DURATION.is_match(raw) && raw.len() > 1 && !raw.ends_with('T');
        if !shaped {
            return Err(FleetError::InvalidInput(format!(
                "timespan {:?} is not an ISO-8601 duration",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Timespan {
    fn default() -> Self {
        Self("P7D".to_string())
    }
}

impl fmt::Display for Timespan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Timespan {
    type Error = FleetError;

    fn try_from(raw: String) -> Result<Self> {
        Timespan::parse(&raw)
    }
}

impl From<Timespan> for String {
    fn from(timespan: Timespan) -> Self {
        timespan.0
    }
}

/// One logical query against a set of workspaces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub workspaces: Vec<WorkspaceId>,

    /// Inline query text or a loader reference (`kql/...`, `kql://...`, URL)
    pub query: String,

    pub timespan: Timespan,

    /// Backend-side filter applied to each call's output
    pub post_filter: Option<String>,

    /// Try one grouped call per batch before per-workspace calls
    pub group_first: bool,
}

impl QueryRequest {
    pub fn new(workspaces: Vec<WorkspaceId>, query: impl Into<String>, timespan: Timespan) -> Self {
        Self {
            workspaces,
            query: query.into(),
            timespan,
            post_filter: None,
            group_first: true,
        }
    }

    pub fn with_post_filter(mut self, filter: impl Into<String>) -> Self {
        self.post_filter = Some(filter.into());
        self
    }

    pub fn individually(mut self) -> Self {
        self.group_first = false;
        self
    }
}

/// A single physical call handed to the remote executor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteCall {
    pub query: String,
    pub targets: Vec<WorkspaceId>,

    /// Absent for backends without a time window (ingestion scripts)
    pub timespan: Option<Timespan>,
    pub post_filter: Option<String>,
}

impl RemoteCall {
    pub fn new(query: impl Into<String>, targets: Vec<WorkspaceId>, timespan: Option<Timespan>) -> Self {
        Self {
            query: query.into(),
            targets,
            timespan,
            post_filter: None,
        }
    }

    /// Same call narrowed to one workspace
    pub fn for_workspace(&self, workspace: &WorkspaceId) -> Self {
        Self {
            targets: vec![workspace.clone()],
            ..self.clone()
        }
    }
}

/// Stamp `workspace` into every row that does not already carry a tenant.
pub fn tag_rows(rows: &mut [Row], workspace: &WorkspaceId) {
    for row in rows.iter_mut() {
        row.entry(TENANT_FIELD.to_string())
            .or_insert_with(|| Value::String(workspace.to_string()));
    }
}

/// Leading table/stream token of a query: first word of its first line.
pub fn leading_table(query: &str) -> String {
    query
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_string)
        .unwrap_or_default()
}
