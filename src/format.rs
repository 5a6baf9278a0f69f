//! Output rendering for merged rows

use crate::error::{FleetError, Result};
use crate::model::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Json,
    Csv,
    /// Same rendering as CSV
    List,
    /// Dry run: print the commands that would be executed
    Cmd,
}

impl FromStr for OutputFormat {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            "list" => Ok(OutputFormat::List),
            "cmd" => Ok(OutputFormat::Cmd),
            other => Err(FleetError::InvalidInput(format!("unknown output format {}", other))),
        }
    }
}

pub fn rows_to_json(rows: &[Row]) -> Result<String> {
    Ok(serde_json::to_string_pretty(rows)?)
}

/// Render rows as CSV. The header is the union of all row fields in the
/// order they are first seen; absent fields are left empty.
pub fn rows_to_csv(rows: &[Row]) -> Result<String> {
    let mut columns: Vec<&str> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.contains(&key.as_str()) {
                columns.push(key.as_str());
            }
        }
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    if !columns.is_empty() {
        writer.write_record(&columns)?;
    }
    for row in rows {
        let record: Vec<String> = columns
            .iter()
            .map(|column| row.get(*column).map(cell_text).unwrap_or_default())
            .collect();
        writer.write_record(&record)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| FleetError::Csv(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| FleetError::Csv(e.to_string()))
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
