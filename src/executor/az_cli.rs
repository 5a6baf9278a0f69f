//! Azure CLI executor
//!
//! Runs `az monitor log-analytics query` as a child process. Authentication is
//! whatever session the `az` binary already holds. A non-zero exit is fatal
//! unless stderr reports a timeout.

use crate::error::{FleetError, Result};
use crate::executor::RemoteExecutor;
use crate::model::{RemoteCall, Row};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

lazy_static::lazy_static! {
    /// Timeout reports the CLI prints before exiting non-zero
    static ref TIMEOUT_STDERR: Regex = Regex::new(
        r"(?i)timed out|timeout|gateway ?time-?out|\b(408|504)\b"
    ).expect("timeout pattern is valid");
}

pub struct AzCliExecutor {
    program: String,
    timeout: Duration,
}

impl AzCliExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: "az".to_string(),
            timeout,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Arguments for one call, without the program name
    pub fn command_args(&self, call: &RemoteCall) -> Result<Vec<String>> {
        let (first, rest) = call.targets.split_first().ok_or_else(|| {
            FleetError::FatalRemote("az-cli call requires at least one workspace".to_string())
        })?;

        let mut args: Vec<String> = ["monitor", "log-analytics", "query", "--workspace"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push(first.to_string());
        if !rest.is_empty() {
            args.push("--workspaces".to_string());
            args.extend(rest.iter().map(|w| w.to_string()));
        }
        args.push("--analytics-query".to_string());
        args.push(call.query.clone());
        if let Some(timespan) = &call.timespan {
            args.push("--timespan".to_string());
            args.push(timespan.to_string());
        }
        if let Some(filter) = &call.post_filter {
            args.push("--query".to_string());
            args.push(filter.clone());
        }
        args.extend(["--only-show-errors", "-o", "json"].iter().map(|s| s.to_string()));
        Ok(args)
    }
}

#[async_trait]
impl RemoteExecutor for AzCliExecutor {
    fn name(&self) -> &'static str {
        "az-cli"
    }

    async fn execute(&self, call: &RemoteCall) -> Result<Vec<Row>> {
        let args = self.command_args(call)?;
        debug!("{}", truncate_line(&shell_join(&self.program, &args), 160));

        let mut command = Command::new(&self.program);
        command.args(&args).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(FleetError::FatalRemote(format!(
                    "Failed to launch {}: {}",
                    self.program, e
                )))
            }
            Err(_) => {
                return Err(FleetError::TransientRemote(format!(
                    "{} query timed out after {:?}",
                    self.program, self.timeout
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = format!("{} exited with {}: {}", self.program, output.status, stderr.trim());
            return Err(exit_failure(message, &stderr));
        }

        parse_rows(&output.stdout)
    }

    fn describe(&self, call: &RemoteCall) -> String {
        match self.command_args(call) {
            Ok(args) => shell_join(&self.program, &args),
            Err(e) => format!("# {}", e),
        }
    }
}

/// Timeouts reported on stderr are retryable, anything else is not
fn exit_failure(message: String, stderr: &str) -> FleetError {
    if TIMEOUT_STDERR.is_match(stderr) {
        FleetError::TransientRemote(message)
    } else {
        FleetError::FatalRemote(message)
    }
}

/// Decode CLI JSON output into rows. Empty output means no rows.
fn parse_rows(stdout: &[u8]) -> Result<Vec<Row>> {
    let text = String::from_utf8_lossy(stdout);
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str::<Value>(&text)? {
        Value::Array(items) => Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(row) => Some(row),
                _ => None,
            })
            .collect()),
        Value::Object(row) => Ok(vec![row]),
        Value::Null => Ok(Vec::new()),
        other => Err(FleetError::FatalRemote(format!(
            "Unexpected CLI output: {}",
            truncate_line(&other.to_string(), 120)
        ))),
    }
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,%+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn shell_join(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().map(|a| shell_quote(a)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn truncate_line(text: &str, max: usize) -> String {
    text.replace('\n', " ").trim().chars().take(max).collect()
}
