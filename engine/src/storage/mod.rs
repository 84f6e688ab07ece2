//! Persistence ports consumed by the engine.
//!
//! The engine never talks to a concrete database. Playback and rollback run
//! against [`Storage`], which bundles transaction control, the state tables
//! mutated by transactions, and the chain tables (blocks, head, rollback log).
//! [`memory::MemoryStore`] is the reference implementation.

pub mod address;
pub mod memory;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tessera_common::error::CodecError;
use tessera_common::hashing::Hash32;
use tessera_common::types::{ColumnDef, ColumnKind, RollbackEntry, RowImage, Transaction};
use thiserror::Error;

pub use address::{resolve, RowFilter};
pub use memory::MemoryStore;

/// A stored column value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Text(String),
    Binary(Vec<u8>),
}

impl Value {
    pub fn empty(kind: ColumnKind) -> Self {
        match kind {
            ColumnKind::Text => Value::Text(String::new()),
            ColumnKind::Binary => Value::Binary(Vec::new()),
        }
    }

    /// String form used in before-images; binary values are hex encoded.
    pub fn to_image(&self) -> String {
        match self {
            Value::Text(text) => text.clone(),
            Value::Binary(bytes) => hex::encode(bytes),
        }
    }

    /// Inverse of [`Value::to_image`] for a column of the given kind.
    pub fn from_image(kind: ColumnKind, image: &str) -> Result<Self, CodecError> {
        Ok(match kind {
            ColumnKind::Text => Value::Text(image.to_string()),
            ColumnKind::Binary => Value::Binary(hex::decode(image)?),
        })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            Value::Binary(_) => None,
        }
    }
}

/// Column values of a row, without its key
pub type Row = BTreeMap<String, Value>;

/// Renders the given columns of a row as a before-image.
pub fn row_image<'a>(row: &Row, columns: impl IntoIterator<Item = &'a String>) -> RowImage {
    columns
        .into_iter()
        .filter_map(|column| row.get(column).map(|v| (column.clone(), v.to_image())))
        .collect()
}

/// Full contents of a dropped table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDump {
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<(RowFilter, Row)>,
}

/// Errors reported by storage backends
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no storage transaction is open")]
    NoTransaction,

    #[error("a storage transaction is already open")]
    TransactionOpen,

    #[error("unknown savepoint {0}")]
    UnknownSavepoint(String),

    #[error("table {0} does not exist")]
    MissingTable(String),

    #[error("table {0} already exists")]
    TableExists(String),

    #[error("view {0} does not exist")]
    MissingView(String),

    #[error("view {0} already exists")]
    ViewExists(String),

    #[error("column {column} does not exist in table {table}")]
    MissingColumn { table: String, column: String },

    #[error("column {column} already exists in table {table}")]
    ColumnExists { table: String, column: String },

    #[error("row {id} not found in table {table}")]
    MissingRow { table: String, id: String },

    #[error("row {id} already exists in table {table}")]
    DuplicateRow { table: String, id: String },

    #[error("block {0} not found")]
    MissingBlock(i64),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// The persisted row of a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub height: i64,
    pub hash: Hash32,
    /// Raw serialized block
    pub data: Vec<u8>,
    /// Digest of this block's own rollback log
    pub rollbacks_hash: Hash32,
    pub time: i64,
    pub node_position: i64,
    pub key_id: i64,
    pub ecosystem_id: i64,
    pub tx_count: usize,
}

/// The chain head pointer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoBlock {
    pub height: i64,
    pub hash: Hash32,
    pub rollbacks_hash: Hash32,
    pub time: i64,
    pub node_position: i64,
    pub key_id: i64,
    pub ecosystem_id: i64,
}

impl From<&BlockRecord> for InfoBlock {
    fn from(record: &BlockRecord) -> Self {
        Self {
            height: record.height,
            hash: record.hash,
            rollbacks_hash: record.rollbacks_hash,
            time: record.time,
            node_position: record.node_position,
            key_id: record.key_id,
            ecosystem_id: record.ecosystem_id,
        }
    }
}

/// Inclusion status of a transaction. `block_id == 0` means not included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxStatusRecord {
    pub hash: Hash32,
    pub block_id: i64,
    pub used: bool,
    pub status: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub tx_hash: Hash32,
    pub recipient: i64,
    pub message: String,
}

/// Value moved to a key by a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub tx_hash: Hash32,
    pub block_id: i64,
    pub key_id: i64,
    pub amount: i64,
}

/// One storage transaction per block, with nested savepoints per
/// transaction. Writes outside a transaction apply immediately.
pub trait TxnControl {
    fn begin(&mut self) -> Result<(), StoreError>;
    fn commit(&mut self) -> Result<(), StoreError>;
    fn abort(&mut self) -> Result<(), StoreError>;
    fn savepoint(&mut self, name: &str) -> Result<(), StoreError>;
    /// Reverts to the savepoint, which stays in place
    fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError>;
    fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError>;
}

/// State mutated by transactions. Table names here are physical; use
/// [`address::resolve`] to turn logical names into physical ones.
pub trait StateTables {
    fn table_exists(&self, table: &str) -> bool;
    fn column_kind(&self, table: &str, column: &str) -> Result<ColumnKind, StoreError>;
    fn get_row(&self, table: &str, filter: &RowFilter) -> Result<Option<Row>, StoreError>;
    /// Every row of the table in key order
    fn table_rows(&self, table: &str) -> Result<Vec<(RowFilter, Row)>, StoreError>;
    /// Missing columns are filled with empty values
    fn insert_row(&mut self, table: &str, filter: &RowFilter, row: Row) -> Result<(), StoreError>;
    /// Overwrites the given columns of an existing row
    fn update_row(&mut self, table: &str, filter: &RowFilter, values: Row)
        -> Result<(), StoreError>;
    fn delete_row(&mut self, table: &str, filter: &RowFilter) -> Result<(), StoreError>;

    fn create_table(&mut self, table: &str, columns: &[ColumnDef]) -> Result<(), StoreError>;
    fn drop_table(&mut self, table: &str) -> Result<TableDump, StoreError>;
    fn add_column(&mut self, table: &str, column: &ColumnDef) -> Result<(), StoreError>;
    fn drop_column(&mut self, table: &str, column: &str) -> Result<(), StoreError>;

    fn view_exists(&self, view: &str) -> bool;
    fn create_view(&mut self, view: &str) -> Result<(), StoreError>;
    fn drop_view(&mut self, view: &str) -> Result<(), StoreError>;

    /// Reads `name` from the ecosystem's parameters table.
    fn ecosystem_parameter(&self, ecosystem: i64, name: &str) -> Result<Option<String>, StoreError> {
        let (table, filter) = address::resolve(&format!("{}_parameters", ecosystem), name)?;
        if !self.table_exists(&table) {
            return Ok(None);
        }
        Ok(self
            .get_row(&table, &filter)?
            .and_then(|row| row.get("value").and_then(Value::as_text).map(str::to_string)))
    }

    /// Rebuilds a before-image into typed values using the table's columns.
    fn decode_image(&self, table: &str, image: &RowImage) -> Result<Row, StoreError> {
        let mut row = Row::new();
        for (column, text) in image {
            let kind = self.column_kind(table, column)?;
            row.insert(column.clone(), Value::from_image(kind, text)?);
        }
        Ok(row)
    }
}

/// Chain tables: blocks, head pointer, rollback log and per-transaction
/// records.
pub trait ChainStore {
    fn info_block(&self) -> Result<Option<InfoBlock>, StoreError>;
    fn set_info_block(&mut self, info: InfoBlock) -> Result<(), StoreError>;

    fn block_by_height(&self, height: i64) -> Result<Option<BlockRecord>, StoreError>;
    fn block_by_hash(&self, hash: &Hash32) -> Result<Option<BlockRecord>, StoreError>;
    fn insert_block(&mut self, record: BlockRecord) -> Result<(), StoreError>;
    fn delete_block(&mut self, height: i64) -> Result<(), StoreError>;

    /// Appends entries; order is preserved per transaction.
    fn append_rollback(&mut self, entries: &[RollbackEntry]) -> Result<(), StoreError>;
    /// Entries of one transaction in recording order
    fn rollback_entries(&self, tx_hash: &Hash32) -> Result<Vec<RollbackEntry>, StoreError>;
    /// Entries of a block in recording order
    fn block_rollback_entries(&self, height: i64) -> Result<Vec<RollbackEntry>, StoreError>;
    fn delete_rollback_entries(&mut self, tx_hash: &Hash32) -> Result<(), StoreError>;

    fn tx_status(&self, hash: &Hash32) -> Result<Option<TxStatusRecord>, StoreError>;
    fn set_tx_status(&mut self, record: TxStatusRecord) -> Result<(), StoreError>;
    /// Clears the used flag and detaches the transaction from its block
    fn reset_tx_status(&mut self, hash: &Hash32) -> Result<(), StoreError>;

    fn insert_log_record(&mut self, hash: &Hash32, block_id: i64) -> Result<(), StoreError>;
    fn delete_log_record(&mut self, hash: &Hash32) -> Result<(), StoreError>;

    fn insert_notifications(&mut self, notifications: &[Notification]) -> Result<(), StoreError>;
    fn delete_notifications(&mut self, tx_hash: &Hash32) -> Result<(), StoreError>;

    fn enqueue_tx(&mut self, tx: Transaction) -> Result<(), StoreError>;
    fn queued_txs(&self) -> Result<Vec<Transaction>, StoreError>;
    fn dequeue_tx(&mut self, hash: &Hash32) -> Result<(), StoreError>;

    fn mark_bad_tx(&mut self, hash: &Hash32, error: &str) -> Result<(), StoreError>;
    fn bad_tx(&self, hash: &Hash32) -> Result<Option<String>, StoreError>;

    fn insert_outputs(&mut self, outputs: &[TxOutput]) -> Result<(), StoreError>;
    fn delete_block_outputs(&mut self, block_id: i64) -> Result<(), StoreError>;

    /// True once the transaction is part of a persisted block
    fn is_committed(&self, hash: &Hash32) -> Result<bool, StoreError> {
        Ok(self
            .tx_status(hash)?
            .map_or(false, |status| status.block_id != 0))
    }
}

/// Counts persisted blocks produced by `node_position` with a timestamp in
/// `[start, end]`.
pub trait BlockCounter {
    fn count_blocks_in_window(
        &self,
        start: i64,
        end: i64,
        node_position: i64,
    ) -> Result<u64, StoreError>;
}

/// Everything the engine needs from a backend
pub trait Storage: TxnControl + StateTables + ChainStore + BlockCounter {}

impl<T: TxnControl + StateTables + ChainStore + BlockCounter> Storage for T {}
