//! Ingestion job definitions and script generation

use crate::error::{FleetError, Result};
use crate::model::{RemoteCall, Timespan, WorkspaceId};
use crate::workspaces::WorkspaceDetails;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestTarget {
    Workspace(WorkspaceId),
    /// The shared backend resource rather than one workspace
    Global,
}

/// One independent remote ingestion statement
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IngestJob {
    pub query: String,
    pub target: IngestTarget,
    pub timespan: Option<Timespan>,
}

impl IngestJob {
    pub fn global(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            target: IngestTarget::Global,
            timespan: None,
        }
    }

    pub fn for_workspace(query: impl Into<String>, workspace: WorkspaceId) -> Self {
        Self {
            query: query.into(),
            target: IngestTarget::Workspace(workspace),
            timespan: None,
        }
    }

    /// Short description used in logs and failure lines
    pub fn label(&self) -> String {
        let first_line = self.query.lines().next().unwrap_or("").trim();
        match &self.target {
            IngestTarget::Workspace(ws) => format!("[{}] {}", ws, first_line),
            IngestTarget::Global => format!("[global] {}", first_line),
        }
    }

    pub fn to_call(&self) -> RemoteCall {
        let targets = match &self.target {
            IngestTarget::Workspace(ws) => vec![ws.clone()],
            IngestTarget::Global => Vec::new(),
        };
        RemoteCall::new(self.query.clone(), targets, self.timespan.clone())
    }
}

impl fmt::Display for IngestJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Split a script into statements separated by blank lines
pub fn split_statements(script: &str) -> Vec<String> {
    script
        .replace("\r\n", "\n")
        .split("\n\n")
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .map(str::to_string)
        .collect()
}

/// `$name` / `${name}` substitution; `$$` is a literal dollar sign
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
}

impl Template {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn substitute(&self, vars: &BTreeMap<String, String>) -> Result<String> {
        let mut out = String::with_capacity(self.source.len());
        let mut chars = self.source.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }
            let name = match chars.peek().map(|(_, next)| *next) {
                Some('$') => {
                    chars.next();
                    out.push('$');
                    continue;
                }
                Some('{') => {
                    chars.next();
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some((_, '}')) => break,
                            Some((_, ch)) if is_ident_char(ch) => name.push(ch),
                            _ => return Err(invalid_placeholder(pos)),
                        }
                    }
                    name
                }
                Some(ch) if ch == '_' || ch.is_ascii_alphabetic() => {
                    let mut name = String::new();
                    while let Some((_, ch)) = chars.peek() {
                        if !is_ident_char(*ch) {
                            break;
                        }
                        name.push(*ch);
                        chars.next();
                    }
                    name
                }
                _ => return Err(invalid_placeholder(pos)),
            };

            if name.is_empty() || name.starts_with(|ch: char| ch.is_ascii_digit()) {
                return Err(invalid_placeholder(pos));
            }
            let value = vars
                .get(&name)
                .ok_or_else(|| FleetError::Template(format!("missing value for ${}", name)))?;
            out.push_str(value);
        }
        Ok(out)
    }
}

fn is_ident_char(ch: char) -> bool {
    ch == '_' || ch.is_ascii_alphanumeric()
}

fn invalid_placeholder(pos: usize) -> FleetError {
    FleetError::Template(format!("invalid placeholder at byte {}", pos))
}

/// Global statements followed by each workspace's rendered statements
pub fn build_jobs(
    global_script: &str,
    workspace_template: &Template,
    details: &[WorkspaceDetails],
) -> Result<Vec<IngestJob>> {
    let mut jobs: Vec<IngestJob> = split_statements(global_script)
        .into_iter()
        .map(IngestJob::global)
        .collect();

    for workspace in details {
        let rendered = workspace_template.substitute(&workspace.variables())?;
        jobs.extend(
            split_statements(&rendered)
                .into_iter()
                .map(|statement| IngestJob::for_workspace(statement, workspace.customer_id.clone())),
        );
    }
    Ok(jobs)
}
