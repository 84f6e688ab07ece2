use serde::{Deserialize, Serialize};
use tessera_common::error::CodecError;

/// Tables that exist once physically (`1_<name>`) and are shared by every
/// ecosystem through an `ecosystem` key column.
pub const FIRST_TABLES: &[&str] = &[
    "keys",
    "contracts",
    "parameters",
    "members",
    "roles",
    "tables",
    "notifications",
    "sections",
    "pages",
    "menu",
];

/// Identifies one row of a physical table
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowFilter {
    pub id: String,
    /// Set only for rows of first tables
    pub ecosystem: Option<i64>,
}

impl RowFilter {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ecosystem: None,
        }
    }

    pub fn in_ecosystem(id: impl Into<String>, ecosystem: i64) -> Self {
        Self {
            id: id.into(),
            ecosystem: Some(ecosystem),
        }
    }

    /// Row id as recorded in rollback entries
    pub fn table_id(&self) -> String {
        match self.ecosystem {
            Some(ecosystem) => format!("{},{}", self.id, ecosystem),
            None => self.id.clone(),
        }
    }
}

/// Splits `"<ecosystem>_<name>"`.
fn split_logical(table: &str) -> Option<(i64, &str)> {
    let (prefix, name) = table.split_once('_')?;
    let ecosystem = prefix.parse::<i64>().ok()?;
    Some((ecosystem, name))
}

pub fn is_first_table(table: &str) -> bool {
    split_logical(table).map_or(false, |(_, name)| FIRST_TABLES.contains(&name))
}

/// Maps a logical table name and row id to the physical table and the row
/// predicate.
///
/// Rows of first tables live in `1_<name>` and are qualified by ecosystem.
/// The ecosystem comes from a composite `"id,ecosystem"` row id when one is
/// given, otherwise from the logical table prefix.
pub fn resolve(table: &str, table_id: &str) -> Result<(String, RowFilter), CodecError> {
    let first = split_logical(table).filter(|(_, name)| FIRST_TABLES.contains(name));

    match (first, table_id.split_once(',')) {
        (Some((_, name)), Some((id, ecosystem))) => {
            let ecosystem = ecosystem.trim().parse::<i64>().map_err(|_| {
                CodecError::Malformed(format!("bad ecosystem in row id {}", table_id))
            })?;
            Ok((format!("1_{}", name), RowFilter::in_ecosystem(id.trim(), ecosystem)))
        }
        (Some((ecosystem, name)), None) => {
            Ok((format!("1_{}", name), RowFilter::in_ecosystem(table_id, ecosystem)))
        }
        (None, Some(_)) => Err(CodecError::Malformed(format!(
            "composite row id {} on non-shared table {}",
            table_id, table
        ))),
        (None, None) => Ok((table.to_string(), RowFilter::by_id(table_id))),
    }
}
