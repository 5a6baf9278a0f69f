//! Workspace directory
//!
//! Loads the fleet inventory from a CSV export. Required columns are
//! `customerId` and `SecOps Group` (the owning agency alias); every other
//! column is kept as-is.

use crate::error::{FleetError, Result};
use crate::model::WorkspaceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

/// Agency value that selects the whole fleet
pub const ALL_AGENCIES: &str = "ALL";

const ID_COLUMN: &str = "customerId";
const ALIAS_COLUMN: &str = "SecOps Group";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    #[serde(rename = "customerId")]
    pub customer_id: WorkspaceId,
    pub alias: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkspaceDirectory {
    records: Vec<WorkspaceRecord>,
}

impl WorkspaceDirectory {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(file)
    }

    /// Parse the inventory. Rows without a customer id are dropped and the
    /// rest are sorted by alias.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::Reader::from_reader(reader);
        let headers = csv_reader.headers()?.clone();
        let id_index = column_index(&headers, ID_COLUMN)?;
        let alias_index = headers.iter().position(|h| h == ALIAS_COLUMN);

        let mut records = Vec::new();
        for result in csv_reader.records() {
            let record = result?;
            let customer_id = record.get(id_index).unwrap_or("").trim();
            if customer_id.is_empty() {
                continue;
            }
            let alias = alias_index
                .and_then(|i| record.get(i))
                .unwrap_or("")
                .trim()
                .to_string();
            let extra = headers
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != id_index && Some(*i) != alias_index)
                .map(|(i, name)| (name.to_string(), record.get(i).unwrap_or("").to_string()))
                .collect();
            records.push(WorkspaceRecord {
                customer_id: WorkspaceId::from(customer_id),
                alias,
                extra,
            });
        }

        records.sort_by(|a, b| a.alias.cmp(&b.alias));
        Ok(Self { records })
    }

    /// Records owned by `agency`; `None` or `"ALL"` selects everything
    pub fn records(&self, agency: Option<&str>) -> Vec<&WorkspaceRecord> {
        match agency {
            None | Some(ALL_AGENCIES) => self.records.iter().collect(),
            Some(agency) => self.records.iter().filter(|r| r.alias == agency).collect(),
        }
    }

    pub fn ids(&self, agency: Option<&str>) -> Vec<WorkspaceId> {
        self.records(agency)
            .into_iter()
            .map(|r| r.customer_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn column_index(headers: &csv::StringRecord, name: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| FleetError::InvalidInput(format!("workspace list has no {} column", name)))
}

/// Resolved workspace attributes used to render per-workspace ingest scripts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceDetails {
    #[serde(rename = "customerId")]
    pub customer_id: WorkspaceId,

    /// Lowercased resource id
    pub id: String,

    /// Lowercased workspace name
    pub name: String,

    /// Name of the function that receives this workspace's ingested rows
    pub ingest_function: String,
}

impl WorkspaceDetails {
    pub fn new(customer_id: impl Into<WorkspaceId>, resource_id: &str, name: &str) -> Self {
        let customer_id = customer_id.into();
        let ingest_function = format!("{}_incoming", customer_id.as_str().replace('-', "_"));
        Self {
            customer_id,
            id: resource_id.to_lowercase(),
            name: name.to_lowercase(),
            ingest_function,
        }
    }

    /// Substitution variables for ingest templates
    pub fn variables(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("customerId".to_string(), self.customer_id.to_string()),
            ("id".to_string(), self.id.clone()),
            ("name".to_string(), self.name.clone()),
            ("ingest_function".to_string(), self.ingest_function.clone()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVENTORY: &str = "\
customerId,SecOps Group,subscription
bbb-2,Transport,sub-2
,Health,sub-x
aaa-1,Health,sub-1
ccc-3,Health,sub-3
";

    #[test]
    fn test_directory_drops_missing_ids_and_sorts_by_alias() {
        let directory = WorkspaceDirectory::from_csv_reader(INVENTORY.as_bytes()).unwrap();
        assert_eq!(directory.len(), 3);
        let aliases: Vec<&str> = directory.records(None).iter().map(|r| r.alias.as_str()).collect();
        assert_eq!(aliases, vec!["Health", "Health", "Transport"]);
        assert_eq!(directory.records(None)[0].extra["subscription"], "sub-1");
    }

    #[test]
    fn test_agency_filter() {
        let directory = WorkspaceDirectory::from_csv_reader(INVENTORY.as_bytes()).unwrap();
        assert_eq!(directory.ids(Some(ALL_AGENCIES)).len(), 3);
        assert_eq!(directory.ids(Some("Transport")), vec![WorkspaceId::from("bbb-2")]);
        assert!(directory.ids(Some("Unknown")).is_empty());
    }

    #[test]
    fn test_missing_id_column() {
        let result = WorkspaceDirectory::from_csv_reader("name\nx\n".as_bytes());
        assert!(matches!(result, Err(FleetError::InvalidInput(_))));
    }

    #[test]
    fn test_workspace_details_normalize() {
        let details = WorkspaceDetails::new(
            "0d1e-44AB",
            "/subscriptions/S1/resourceGroups/RG/providers/Microsoft.OperationalInsights/workspaces/WS",
            "Prod-WS",
        );
        assert_eq!(details.ingest_function, "0d1e_44AB_incoming");
        assert!(details.id.ends_with("workspaces/ws"));
        assert_eq!(details.name, "prod-ws");
    }
}
