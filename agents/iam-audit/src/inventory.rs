//! Role inventory files
//!
//! Reads a spreadsheet-style role export with `Role Name`, `Creation Date`,
//! `Last Used` and `Attached Policies` columns. Header names are trimmed and
//! blank or unparseable timestamps are treated as absent.

use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::InventoryError;
use crate::types::{parse_timestamp, RoleRecord};

const ROLE_NAME: &str = "Role Name";
const CREATION_DATE: &str = "Creation Date";
const LAST_USED: &str = "Last Used";
const ATTACHED_POLICIES: &str = "Attached Policies";

struct Columns {
    role_name: usize,
    creation_date: Option<usize>,
    last_used: Option<usize>,
    attached_policies: Option<usize>,
}

impl Columns {
    fn locate(headers: &csv::StringRecord, source: &str) -> Result<Self, InventoryError> {
        let find = |name: &str| headers.iter().position(|h| h.trim() == name);

        let role_name = find(ROLE_NAME).ok_or_else(|| InventoryError::Input {
            path: source.to_string(),
            message: format!("missing `{}` column", ROLE_NAME),
        })?;

        let columns = Self {
            role_name,
            creation_date: find(CREATION_DATE),
            last_used: find(LAST_USED),
            attached_policies: find(ATTACHED_POLICIES),
        };
        if columns.last_used.is_none() {
            warn!(source = %source, "No `{}` column, every role will have unknown usage", LAST_USED);
        }
        Ok(columns)
    }
}

/// Split an attached-policies cell on `,` or `;`
pub fn split_policies(cell: &str) -> Vec<String> {
    cell.split([',', ';'])
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse role records from any CSV reader; `source` names it in errors
pub fn read_roles<R: Read>(reader: R, source: &str) -> Result<Vec<RoleRecord>, InventoryError> {
    let input_error = |e: csv::Error| InventoryError::Input {
        path: source.to_string(),
        message: e.to_string(),
    };

    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = rdr.headers().map_err(input_error)?.clone();
    let columns = Columns::locate(&headers, source)?;

    let cell = |record: &csv::StringRecord, idx: Option<usize>| -> String {
        idx.and_then(|i| record.get(i)).unwrap_or("").trim().to_string()
    };

    let mut roles = Vec::new();
    for record in rdr.records() {
        let record = record.map_err(input_error)?;
        let name = cell(&record, Some(columns.role_name));
        if name.is_empty() {
            continue;
        }

        roles.push(RoleRecord {
            name,
            created_at: parse_timestamp(&cell(&record, columns.creation_date)),
            last_used: parse_timestamp(&cell(&record, columns.last_used)),
            attached_policies: split_policies(&cell(&record, columns.attached_policies)),
        });
    }

    debug!(source = %source, roles = roles.len(), "Role inventory parsed");
    Ok(roles)
}

/// Read a role inventory file from disk
pub async fn load_roles(path: &Path) -> Result<Vec<RoleRecord>, InventoryError> {
    let source = path.display().to_string();
    let bytes = tokio::fs::read(path).await.map_err(|e| InventoryError::Input {
        path: source.clone(),
        message: e.to_string(),
    })?;
    read_roles(bytes.as_slice(), &source)
}
