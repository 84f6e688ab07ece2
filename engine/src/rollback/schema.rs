use tessera_common::types::{ColumnDef, SchemaChange};

use crate::executor::ECOSYSTEMS_TABLE;
use crate::storage::{resolve, Row, RowFilter, StateTables, StoreError, Value};

/// Applies the compensation of one schema-level mutation.
pub(super) fn undo(store: &mut dyn StateTables, change: &SchemaChange) -> Result<(), StoreError> {
    match change {
        SchemaChange::NewTable { name } => store.drop_table(name).map(|_| ()),
        SchemaChange::NewView { name } => store.drop_view(name),
        SchemaChange::NewColumn { table, column } => store.drop_column(table, column),
        SchemaChange::DeleteColumn {
            table,
            column,
            kind,
        } => store.add_column(
            table,
            &ColumnDef {
                name: column.clone(),
                kind: *kind,
            },
        ),
        SchemaChange::DeleteTable {
            name,
            columns,
            rows,
        } => {
            store.create_table(name, columns)?;
            for row in rows {
                let filter = RowFilter {
                    id: row.id.clone(),
                    ecosystem: row.ecosystem,
                };
                let values = store.decode_image(name, &row.values)?;
                store.insert_row(name, &filter, values)?;
            }
            Ok(())
        }
        SchemaChange::NewContract { ecosystem, id } => {
            let (table, filter) = contract(*ecosystem, *id)?;
            store.delete_row(&table, &filter)
        }
        SchemaChange::EditContract {
            ecosystem,
            id,
            source,
        } => {
            let (table, filter) = contract(*ecosystem, *id)?;
            store.update_row(&table, &filter, single("value", source))
        }
        SchemaChange::ActivateContract { ecosystem, id } => {
            let (table, filter) = contract(*ecosystem, *id)?;
            store.update_row(&table, &filter, single("active", "0"))
        }
        SchemaChange::DeactivateContract { ecosystem, id } => {
            let (table, filter) = contract(*ecosystem, *id)?;
            store.update_row(&table, &filter, single("active", "1"))
        }
        SchemaChange::NewEcosystem { id } => {
            store.delete_row(ECOSYSTEMS_TABLE, &RowFilter::by_id(id.to_string()))
        }
    }
}

fn contract(ecosystem: i64, id: i64) -> Result<(String, RowFilter), StoreError> {
    Ok(resolve(&format!("{}_contracts", ecosystem), &id.to_string())?)
}

fn single(column: &str, value: &str) -> Row {
    Row::from([(column.to_string(), Value::Text(value.to_string()))])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use tessera_common::types::{ColumnKind, TableRow};

    #[test]
    fn test_delete_table_restores_rows() {
        let mut store = MemoryStore::with_first_tables();
        let before = store.state_snapshot();
        let dump = store.drop_table("1_ecosystems").unwrap();

        let change = SchemaChange::DeleteTable {
            name: "1_ecosystems".to_string(),
            columns: dump.columns,
            rows: dump
                .rows
                .iter()
                .map(|(filter, row)| TableRow {
                    id: filter.id.clone(),
                    ecosystem: filter.ecosystem,
                    values: crate::storage::row_image(row, row.keys()),
                })
                .collect(),
        };
        undo(&mut store, &change).unwrap();
        assert_eq!(store.state_snapshot(), before);
    }

    #[test]
    fn test_delete_column_comes_back_empty() {
        let mut store = MemoryStore::with_first_tables();
        let change = SchemaChange::DeleteColumn {
            table: "1_ecosystems".to_string(),
            column: "flag".to_string(),
            kind: ColumnKind::Binary,
        };
        undo(&mut store, &change).unwrap();

        let row = store
            .get_row("1_ecosystems", &RowFilter::by_id("1"))
            .unwrap()
            .unwrap();
        assert_eq!(row.get("flag"), Some(&Value::Binary(Vec::new())));
    }

    #[test]
    fn test_undo_of_missing_view_fails() {
        let mut store = MemoryStore::new();
        let change = SchemaChange::NewView {
            name: "1_nothing".to_string(),
        };
        assert!(matches!(undo(&mut store, &change), Err(StoreError::MissingView(_))));
    }
}
