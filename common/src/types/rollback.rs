use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::hashing::{sha256, Hash32, ZERO_HASH};

/// Table name under which schema-level mutations are logged. Entries
/// targeting it carry a [`SchemaChange`] instead of a row before-image.
pub const SCHEMA_TABLE: &str = "system_tables";

/// Column values of a row as stored in a before-image. Binary columns are
/// hex encoded.
pub type RowImage = BTreeMap<String, String>;

/// One recorded mutation of a transaction.
///
/// An empty `data` means the row was inserted, so undoing it deletes the
/// row. Otherwise `data` holds the JSON before-image of the changed columns,
/// or a JSON [`SchemaChange`] when `table_name` is [`SCHEMA_TABLE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackEntry {
    pub tx_hash: Hash32,
    pub block_id: i64,
    pub table_name: String,
    /// Row id, or `"id,ecosystem"` for rows of shared first tables
    pub table_id: String,
    pub data: String,
}

impl RollbackEntry {
    /// Marker for a freshly inserted row
    pub fn insert(tx_hash: Hash32, table_name: &str, table_id: &str) -> Self {
        Self {
            tx_hash,
            block_id: 0,
            table_name: table_name.to_string(),
            table_id: table_id.to_string(),
            data: String::new(),
        }
    }

    /// Before-image of the columns an update is about to overwrite
    pub fn update(
        tx_hash: Hash32,
        table_name: &str,
        table_id: &str,
        before: &RowImage,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            tx_hash,
            block_id: 0,
            table_name: table_name.to_string(),
            table_id: table_id.to_string(),
            data: serde_json::to_string(before)?,
        })
    }

    pub fn schema(tx_hash: Hash32, change: &SchemaChange) -> Result<Self, CodecError> {
        Ok(Self {
            tx_hash,
            block_id: 0,
            table_name: SCHEMA_TABLE.to_string(),
            table_id: change.target(),
            data: serde_json::to_string(change)?,
        })
    }

    pub fn is_insert(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_schema(&self) -> bool {
        self.table_name == SCHEMA_TABLE
    }

    /// Decodes the before-image; `None` for insert markers.
    pub fn before_image(&self) -> Result<Option<RowImage>, CodecError> {
        if self.is_insert() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&self.data)?))
    }

    pub fn schema_change(&self) -> Result<SchemaChange, CodecError> {
        if !self.is_schema() {
            return Err(CodecError::InvalidStructure(format!(
                "entry for table {} is not a schema change",
                self.table_name
            )));
        }
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// Storage encoding of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Binary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
}

/// A row of a dropped table, kept so the table can be rebuilt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRow {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecosystem: Option<i64>,
    pub values: RowImage,
}

/// Schema-level mutations a transaction can perform. Each variant carries
/// what its compensation needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchemaChange {
    NewTable {
        name: String,
    },
    NewView {
        name: String,
    },
    NewColumn {
        table: String,
        column: String,
    },
    /// Column values are restored by row entries logged before this one.
    DeleteColumn {
        table: String,
        column: String,
        kind: ColumnKind,
    },
    DeleteTable {
        name: String,
        columns: Vec<ColumnDef>,
        rows: Vec<TableRow>,
    },
    NewContract {
        ecosystem: i64,
        id: i64,
    },
    EditContract {
        ecosystem: i64,
        id: i64,
        /// Source before the edit
        source: String,
    },
    ActivateContract {
        ecosystem: i64,
        id: i64,
    },
    DeactivateContract {
        ecosystem: i64,
        id: i64,
    },
    NewEcosystem {
        id: i64,
    },
}

impl SchemaChange {
    fn target(&self) -> String {
        match self {
            SchemaChange::NewTable { name }
            | SchemaChange::NewView { name }
            | SchemaChange::DeleteTable { name, .. } => name.clone(),
            SchemaChange::NewColumn { table, column }
            | SchemaChange::DeleteColumn { table, column, .. } => format!("{}.{}", table, column),
            SchemaChange::NewContract { ecosystem, id }
            | SchemaChange::EditContract { ecosystem, id, .. }
            | SchemaChange::ActivateContract { ecosystem, id }
            | SchemaChange::DeactivateContract { ecosystem, id } => format!("{},{}", id, ecosystem),
            SchemaChange::NewEcosystem { id } => id.to_string(),
        }
    }
}

/// Digest over a block's rollback log in recording order.
///
/// `block_id` is left out: it is assigned when the entries are persisted and
/// the digest must be computable before that.
pub fn rollback_digest(entries: &[RollbackEntry]) -> Hash32 {
    if entries.is_empty() {
        return ZERO_HASH;
    }

    let mut buf = Vec::new();
    for entry in entries {
        buf.extend_from_slice(&entry.tx_hash);
        for field in [&entry.table_name, &entry.table_id, &entry.data] {
            buf.extend_from_slice(&(field.len() as u64).to_be_bytes());
            buf.extend_from_slice(field.as_bytes());
        }
    }
    sha256(&[&buf[..]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_has_no_before_image() {
        let entry = RollbackEntry::insert([1; 32], "1_keys", "5");
        assert!(entry.is_insert());
        assert_eq!(entry.before_image().unwrap(), None);
    }

    #[test]
    fn test_update_keeps_before_image() {
        let mut before = RowImage::new();
        before.insert("amount".to_string(), "100".to_string());
        let entry = RollbackEntry::update([1; 32], "1_keys", "5", &before).unwrap();
        assert_eq!(entry.before_image().unwrap(), Some(before));
    }

    #[test]
    fn test_schema_change_is_tagged() {
        let change = SchemaChange::NewTable {
            name: "1_orders".to_string(),
        };
        let entry = RollbackEntry::schema([2; 32], &change).unwrap();

        assert!(entry.data.contains("\"type\":\"new_table\""));
        assert_eq!(entry.schema_change().unwrap(), change);
    }

    #[test]
    fn test_unknown_schema_tag_rejected() {
        let mut entry = RollbackEntry::schema(
            [2; 32],
            &SchemaChange::NewEcosystem { id: 3 },
        )
        .unwrap();
        entry.data = r#"{"type":"drop_database"}"#.to_string();
        assert!(matches!(entry.schema_change(), Err(CodecError::Json(_))));
    }

    #[test]
    fn test_digest_ignores_block_id_but_not_order() {
        let a = RollbackEntry::insert([1; 32], "1_keys", "1");
        let b = RollbackEntry::insert([1; 32], "1_keys", "2");
        let digest = rollback_digest(&[a.clone(), b.clone()]);

        let mut stored = a.clone();
        stored.block_id = 42;
        assert_eq!(rollback_digest(&[stored, b.clone()]), digest);
        assert_ne!(rollback_digest(&[b, a]), digest);
        assert_eq!(rollback_digest(&[]), ZERO_HASH);
    }
}
