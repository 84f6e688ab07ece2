use std::collections::{BTreeMap, BTreeSet};

use tessera_common::hashing::Hash32;
use tessera_common::types::{ColumnDef, ColumnKind, RollbackEntry, Transaction};

use super::{
    BlockCounter, BlockRecord, ChainStore, InfoBlock, Notification, Row, RowFilter, StateTables,
    StoreError, TableDump, TxOutput, TxStatusRecord, TxnControl, Value,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Table {
    columns: BTreeMap<String, ColumnKind>,
    rows: BTreeMap<RowFilter, Row>,
}

impl Table {
    fn new(columns: &[ColumnDef]) -> Self {
        Self {
            columns: columns.iter().map(|c| (c.name.clone(), c.kind)).collect(),
            rows: BTreeMap::new(),
        }
    }

    fn kind(&self, column: &str) -> Option<ColumnKind> {
        self.columns.get(column).copied()
    }
}

/// Everything a [`MemoryStore`] holds. Cloned wholesale for transactions and
/// savepoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreState {
    tables: BTreeMap<String, Table>,
    views: BTreeSet<String>,
    info: Option<InfoBlock>,
    blocks: BTreeMap<i64, BlockRecord>,
    rollback_log: Vec<RollbackEntry>,
    tx_status: BTreeMap<Hash32, TxStatusRecord>,
    log_records: BTreeMap<Hash32, i64>,
    notifications: Vec<Notification>,
    queue: Vec<Transaction>,
    bad_txs: BTreeMap<Hash32, String>,
    outputs: Vec<TxOutput>,
}

#[derive(Debug)]
struct OpenTxn {
    begin: StoreState,
    savepoints: Vec<(String, StoreState)>,
}

/// In-memory reference storage with snapshot-based transactions
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: StoreState,
    txn: Option<OpenTxn>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding the shared first tables and ecosystem 1
    pub fn with_first_tables() -> Self {
        let text = |name: &str| ColumnDef {
            name: name.to_string(),
            kind: ColumnKind::Text,
        };
        let binary = |name: &str| ColumnDef {
            name: name.to_string(),
            kind: ColumnKind::Binary,
        };

        let mut store = Self::new();
        let tables = [
            ("1_keys", vec![text("amount"), binary("pub")]),
            ("1_contracts", vec![text("value"), text("active")]),
            ("1_parameters", vec![text("value")]),
            ("1_ecosystems", vec![text("name")]),
        ];
        for (name, columns) in tables {
            store.state.tables.insert(name.to_string(), Table::new(&columns));
        }

        let mut row = Row::new();
        row.insert("name".to_string(), Value::Text("platform".to_string()));
        store
            .state
            .tables
            .entry("1_ecosystems".to_string())
            .or_default()
            .rows
            .insert(RowFilter::by_id("1"), row);
        store
    }

    /// Copy of the whole state, for comparisons in tests and tooling
    pub fn state_snapshot(&self) -> StoreState {
        self.state.clone()
    }

    fn table(&self, name: &str) -> Result<&Table, StoreError> {
        self.state
            .tables
            .get(name)
            .ok_or_else(|| StoreError::MissingTable(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table, StoreError> {
        self.state
            .tables
            .get_mut(name)
            .ok_or_else(|| StoreError::MissingTable(name.to_string()))
    }

    fn open_txn(&mut self) -> Result<&mut OpenTxn, StoreError> {
        self.txn.as_mut().ok_or(StoreError::NoTransaction)
    }

    fn savepoint_index(txn: &OpenTxn, name: &str) -> Result<usize, StoreError> {
        txn.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| StoreError::UnknownSavepoint(name.to_string()))
    }
}

impl TxnControl for MemoryStore {
    fn begin(&mut self) -> Result<(), StoreError> {
        if self.txn.is_some() {
            return Err(StoreError::TransactionOpen);
        }
        self.txn = Some(OpenTxn {
            begin: self.state.clone(),
            savepoints: Vec::new(),
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.txn.take().map(|_| ()).ok_or(StoreError::NoTransaction)
    }

    fn abort(&mut self) -> Result<(), StoreError> {
        let txn = self.txn.take().ok_or(StoreError::NoTransaction)?;
        self.state = txn.begin;
        Ok(())
    }

    fn savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        let snapshot = self.state.clone();
        self.open_txn()?.savepoints.push((name.to_string(), snapshot));
        Ok(())
    }

    fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        let txn = self.open_txn()?;
        let index = Self::savepoint_index(txn, name)?;
        txn.savepoints.truncate(index + 1);
        let snapshot = txn.savepoints[index].1.clone();
        self.state = snapshot;
        Ok(())
    }

    fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        let txn = self.open_txn()?;
        let index = Self::savepoint_index(txn, name)?;
        txn.savepoints.truncate(index);
        Ok(())
    }
}

impl StateTables for MemoryStore {
    fn table_exists(&self, table: &str) -> bool {
        self.state.tables.contains_key(table)
    }

    fn column_kind(&self, table: &str, column: &str) -> Result<ColumnKind, StoreError> {
        self.table(table)?
            .kind(column)
            .ok_or_else(|| StoreError::MissingColumn {
                table: table.to_string(),
                column: column.to_string(),
            })
    }

    fn get_row(&self, table: &str, filter: &RowFilter) -> Result<Option<Row>, StoreError> {
        Ok(self.table(table)?.rows.get(filter).cloned())
    }

    fn table_rows(&self, table: &str) -> Result<Vec<(RowFilter, Row)>, StoreError> {
        Ok(self
            .table(table)?
            .rows
            .iter()
            .map(|(filter, row)| (filter.clone(), row.clone()))
            .collect())
    }

    fn insert_row(&mut self, table: &str, filter: &RowFilter, row: Row) -> Result<(), StoreError> {
        let t = self.table_mut(table)?;
        if t.rows.contains_key(filter) {
            return Err(StoreError::DuplicateRow {
                table: table.to_string(),
                id: filter.table_id(),
            });
        }
        if let Some(column) = row.keys().find(|c| t.kind(c).is_none()) {
            return Err(StoreError::MissingColumn {
                table: table.to_string(),
                column: column.clone(),
            });
        }

        let mut full: Row = t
            .columns
            .iter()
            .map(|(name, kind)| (name.clone(), Value::empty(*kind)))
            .collect();
        full.extend(row);
        t.rows.insert(filter.clone(), full);
        Ok(())
    }

    fn update_row(
        &mut self,
        table: &str,
        filter: &RowFilter,
        values: Row,
    ) -> Result<(), StoreError> {
        let t = self.table_mut(table)?;
        if let Some(column) = values.keys().find(|c| t.kind(c).is_none()) {
            return Err(StoreError::MissingColumn {
                table: table.to_string(),
                column: column.clone(),
            });
        }
        let row = t.rows.get_mut(filter).ok_or_else(|| StoreError::MissingRow {
            table: table.to_string(),
            id: filter.table_id(),
        })?;
        row.extend(values);
        Ok(())
    }

    fn delete_row(&mut self, table: &str, filter: &RowFilter) -> Result<(), StoreError> {
        self.table_mut(table)?
            .rows
            .remove(filter)
            .map(|_| ())
            .ok_or_else(|| StoreError::MissingRow {
                table: table.to_string(),
                id: filter.table_id(),
            })
    }

    fn create_table(&mut self, table: &str, columns: &[ColumnDef]) -> Result<(), StoreError> {
        if self.table_exists(table) {
            return Err(StoreError::TableExists(table.to_string()));
        }
        self.state.tables.insert(table.to_string(), Table::new(columns));
        Ok(())
    }

    fn drop_table(&mut self, table: &str) -> Result<TableDump, StoreError> {
        let t = self
            .state
            .tables
            .remove(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;
        Ok(TableDump {
            columns: t
                .columns
                .into_iter()
                .map(|(name, kind)| ColumnDef { name, kind })
                .collect(),
            rows: t.rows.into_iter().collect(),
        })
    }

    fn add_column(&mut self, table: &str, column: &ColumnDef) -> Result<(), StoreError> {
        let t = self.table_mut(table)?;
        if t.kind(&column.name).is_some() {
            return Err(StoreError::ColumnExists {
                table: table.to_string(),
                column: column.name.clone(),
            });
        }
        t.columns.insert(column.name.clone(), column.kind);
        for row in t.rows.values_mut() {
            row.insert(column.name.clone(), Value::empty(column.kind));
        }
        Ok(())
    }

    fn drop_column(&mut self, table: &str, column: &str) -> Result<(), StoreError> {
        let t = self.table_mut(table)?;
        if t.columns.remove(column).is_none() {
            return Err(StoreError::MissingColumn {
                table: table.to_string(),
                column: column.to_string(),
            });
        }
        for row in t.rows.values_mut() {
            row.remove(column);
        }
        Ok(())
    }

    fn view_exists(&self, view: &str) -> bool {
        self.state.views.contains(view)
    }

    fn create_view(&mut self, view: &str) -> Result<(), StoreError> {
        if !self.state.views.insert(view.to_string()) {
            return Err(StoreError::ViewExists(view.to_string()));
        }
        Ok(())
    }

    fn drop_view(&mut self, view: &str) -> Result<(), StoreError> {
        if !self.state.views.remove(view) {
            return Err(StoreError::MissingView(view.to_string()));
        }
        Ok(())
    }
}

impl ChainStore for MemoryStore {
    fn info_block(&self) -> Result<Option<InfoBlock>, StoreError> {
        Ok(self.state.info.clone())
    }

    fn set_info_block(&mut self, info: InfoBlock) -> Result<(), StoreError> {
        self.state.info = Some(info);
        Ok(())
    }

    fn block_by_height(&self, height: i64) -> Result<Option<BlockRecord>, StoreError> {
        Ok(self.state.blocks.get(&height).cloned())
    }

    fn block_by_hash(&self, hash: &Hash32) -> Result<Option<BlockRecord>, StoreError> {
        Ok(self.state.blocks.values().find(|b| &b.hash == hash).cloned())
    }

    fn insert_block(&mut self, record: BlockRecord) -> Result<(), StoreError> {
        self.state.blocks.insert(record.height, record);
        Ok(())
    }

    fn delete_block(&mut self, height: i64) -> Result<(), StoreError> {
        self.state
            .blocks
            .remove(&height)
            .map(|_| ())
            .ok_or(StoreError::MissingBlock(height))
    }

    fn append_rollback(&mut self, entries: &[RollbackEntry]) -> Result<(), StoreError> {
        self.state.rollback_log.extend_from_slice(entries);
        Ok(())
    }

    fn rollback_entries(&self, tx_hash: &Hash32) -> Result<Vec<RollbackEntry>, StoreError> {
        Ok(self
            .state
            .rollback_log
            .iter()
            .filter(|e| &e.tx_hash == tx_hash)
            .cloned()
            .collect())
    }

    fn block_rollback_entries(&self, height: i64) -> Result<Vec<RollbackEntry>, StoreError> {
        Ok(self
            .state
            .rollback_log
            .iter()
            .filter(|e| e.block_id == height)
            .cloned()
            .collect())
    }

    fn delete_rollback_entries(&mut self, tx_hash: &Hash32) -> Result<(), StoreError> {
        self.state.rollback_log.retain(|e| &e.tx_hash != tx_hash);
        Ok(())
    }

    fn tx_status(&self, hash: &Hash32) -> Result<Option<TxStatusRecord>, StoreError> {
        Ok(self.state.tx_status.get(hash).cloned())
    }

    fn set_tx_status(&mut self, record: TxStatusRecord) -> Result<(), StoreError> {
        self.state.tx_status.insert(record.hash, record);
        Ok(())
    }

    fn reset_tx_status(&mut self, hash: &Hash32) -> Result<(), StoreError> {
        // A status row only exists for transactions that went through a block
        self.state.tx_status.remove(hash);
        Ok(())
    }

    fn insert_log_record(&mut self, hash: &Hash32, block_id: i64) -> Result<(), StoreError> {
        self.state.log_records.insert(*hash, block_id);
        Ok(())
    }

    fn delete_log_record(&mut self, hash: &Hash32) -> Result<(), StoreError> {
        self.state.log_records.remove(hash);
        Ok(())
    }

    fn insert_notifications(&mut self, notifications: &[Notification]) -> Result<(), StoreError> {
        self.state.notifications.extend_from_slice(notifications);
        Ok(())
    }

    fn delete_notifications(&mut self, tx_hash: &Hash32) -> Result<(), StoreError> {
        self.state.notifications.retain(|n| &n.tx_hash != tx_hash);
        Ok(())
    }

    fn enqueue_tx(&mut self, tx: Transaction) -> Result<(), StoreError> {
        if !self.state.queue.iter().any(|queued| queued.hash == tx.hash) {
            self.state.queue.push(tx);
        }
        Ok(())
    }

    fn queued_txs(&self) -> Result<Vec<Transaction>, StoreError> {
        Ok(self.state.queue.clone())
    }

    fn dequeue_tx(&mut self, hash: &Hash32) -> Result<(), StoreError> {
        self.state.queue.retain(|tx| &tx.hash != hash);
        Ok(())
    }

    fn mark_bad_tx(&mut self, hash: &Hash32, error: &str) -> Result<(), StoreError> {
        self.state.bad_txs.insert(*hash, error.to_string());
        Ok(())
    }

    fn bad_tx(&self, hash: &Hash32) -> Result<Option<String>, StoreError> {
        Ok(self.state.bad_txs.get(hash).cloned())
    }

    fn insert_outputs(&mut self, outputs: &[TxOutput]) -> Result<(), StoreError> {
        self.state.outputs.extend_from_slice(outputs);
        Ok(())
    }

    fn delete_block_outputs(&mut self, block_id: i64) -> Result<(), StoreError> {
        self.state.outputs.retain(|o| o.block_id != block_id);
        Ok(())
    }
}

impl BlockCounter for MemoryStore {
    fn count_blocks_in_window(
        &self,
        start: i64,
        end: i64,
        node_position: i64,
    ) -> Result<u64, StoreError> {
        Ok(self
            .state
            .blocks
            .values()
            .filter(|b| b.node_position == node_position && b.time >= start && b.time <= end)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amount(value: &str) -> Row {
        let mut row = Row::new();
        row.insert("amount".to_string(), Value::Text(value.to_string()));
        row
    }

    #[test]
    fn test_savepoint_rollback_keeps_earlier_work() {
        let mut store = MemoryStore::with_first_tables();
        let key = RowFilter::in_ecosystem("1", 1);

        store.begin().unwrap();
        store.savepoint("tx-0").unwrap();
        store.insert_row("1_keys", &key, amount("10")).unwrap();
        store.release_savepoint("tx-0").unwrap();

        store.savepoint("tx-1").unwrap();
        store.update_row("1_keys", &key, amount("99")).unwrap();
        store.rollback_to_savepoint("tx-1").unwrap();
        store.commit().unwrap();

        let row = store.get_row("1_keys", &key).unwrap().unwrap();
        assert_eq!(row.get("amount"), Some(&Value::Text("10".to_string())));
        // missing columns are filled on insert
        assert_eq!(row.get("pub"), Some(&Value::Binary(Vec::new())));
    }

    #[test]
    fn test_abort_restores_begin_state() {
        let mut store = MemoryStore::with_first_tables();
        let before = store.state_snapshot();

        store.begin().unwrap();
        store.create_table("1_orders", &[]).unwrap();
        store.create_view("1_orders_view").unwrap();
        store.abort().unwrap();

        assert_eq!(store.state_snapshot(), before);
        assert!(matches!(store.commit(), Err(StoreError::NoTransaction)));
    }

    #[test]
    fn test_nested_begin_rejected() {
        let mut store = MemoryStore::new();
        store.begin().unwrap();
        assert!(matches!(store.begin(), Err(StoreError::TransactionOpen)));
        assert!(matches!(
            store.rollback_to_savepoint("missing"),
            Err(StoreError::UnknownSavepoint(_))
        ));
    }

    #[test]
    fn test_column_lifecycle() {
        let mut store = MemoryStore::with_first_tables();
        let key = RowFilter::in_ecosystem("1", 1);
        store.insert_row("1_keys", &key, amount("5")).unwrap();

        let column = ColumnDef {
            name: "nick".to_string(),
            kind: ColumnKind::Text,
        };
        store.add_column("1_keys", &column).unwrap();
        assert_eq!(store.column_kind("1_keys", "nick").unwrap(), ColumnKind::Text);

        store.drop_column("1_keys", "nick").unwrap();
        let row = store.get_row("1_keys", &key).unwrap().unwrap();
        assert!(!row.contains_key("nick"));
        assert!(store.update_row("1_keys", &key, {
            let mut r = Row::new();
            r.insert("nick".to_string(), Value::Text("x".to_string()));
            r
        })
        .is_err());
    }

    #[test]
    fn test_count_blocks_in_window() {
        let mut store = MemoryStore::new();
        for (height, time, position) in [(1, 100, 0), (2, 105, 1), (3, 110, 0)] {
            store
                .insert_block(BlockRecord {
                    height,
                    hash: [height as u8; 32],
                    data: Vec::new(),
                    rollbacks_hash: [0; 32],
                    time,
                    node_position: position,
                    key_id: 1,
                    ecosystem_id: 1,
                    tx_count: 0,
                })
                .unwrap();
        }

        assert_eq!(store.count_blocks_in_window(100, 110, 0).unwrap(), 2);
        assert_eq!(store.count_blocks_in_window(101, 109, 0).unwrap(), 0);
        assert_eq!(store.count_blocks_in_window(101, 109, 1).unwrap(), 1);
        assert!(store.block_by_hash(&[2; 32]).unwrap().is_some());
    }

    #[test]
    fn test_ecosystem_parameter_lookup() {
        let mut store = MemoryStore::with_first_tables();
        let mut row = Row::new();
        row.insert("value".to_string(), Value::Text("3".to_string()));
        store
            .insert_row("1_parameters", &RowFilter::in_ecosystem("max_tx_block_per_user", 2), row)
            .unwrap();

        assert_eq!(
            store.ecosystem_parameter(2, "max_tx_block_per_user").unwrap(),
            Some("3".to_string())
        );
        assert_eq!(store.ecosystem_parameter(1, "max_tx_block_per_user").unwrap(), None);
    }
}
