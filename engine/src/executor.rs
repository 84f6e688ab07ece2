//! Reference transaction executor.
//!
//! Transaction payloads carry a JSON list of [`Instruction`]s. Every state
//! mutation goes through the supplied store and is reported as a rollback
//! entry in the order it was performed.

use std::collections::BTreeMap;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tessera_common::error::CodecError;
use tessera_common::types::{ColumnDef, RollbackEntry, SchemaChange, TableRow, Transaction};

use crate::ports::{ExecContext, ExecError, ExecOutcome, TxExecutor};
use crate::seed::TxRng;
use crate::storage::{resolve, row_image, Notification, Row, RowFilter, Storage, TxOutput, Value};

/// Work units a single transaction may burn before the VM gives up
pub const VM_TIME_BUDGET_UNITS: u64 = 10_000_000;

/// Status recorded for every successfully executed transaction
pub const STATUS_OK: i64 = 1;

/// Registry of ecosystems, one row per ecosystem id
pub const ECOSYSTEMS_TABLE: &str = "1_ecosystems";

/// One step of a transaction program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instruction {
    /// Credits a key in the transaction's ecosystem
    Mint { key_id: i64, amount: i64 },
    /// Moves value from the sender to another key
    Transfer { to: i64, amount: i64 },
    /// Overwrites columns of an existing row
    SetRow {
        table: String,
        id: String,
        values: BTreeMap<String, String>,
    },
    InsertRow {
        table: String,
        id: String,
        values: BTreeMap<String, String>,
    },
    CreateTable { name: String, columns: Vec<ColumnDef> },
    CreateView { name: String },
    AddColumn { table: String, column: ColumnDef },
    DropColumn { table: String, column: String },
    DropTable { name: String },
    NewContract { id: i64, source: String },
    EditContract { id: i64, source: String },
    ActivateContract { id: i64 },
    DeactivateContract { id: i64 },
    NewEcosystem { id: i64, name: String },
    /// Writes a value drawn from the transaction's random generator
    Random {
        table: String,
        id: String,
        column: String,
    },
    Notify { recipient: i64, message: String },
    /// Simulates VM work
    Burn { units: u64 },
    Fail { message: String },
    StopNetwork,
    Noop {
        #[serde(default)]
        pad: String,
    },
}

impl Instruction {
    /// Serializes a program into a transaction payload.
    pub fn encode_program(program: &[Instruction]) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(program)?)
    }
}

/// Interprets instruction programs against [`Storage`]
#[derive(Debug, Default, Clone, Copy)]
pub struct LedgerExecutor;

impl<S: Storage> TxExecutor<S> for LedgerExecutor {
    fn execute(
        &mut self,
        store: &mut S,
        tx: &Transaction,
        _ctx: &ExecContext<'_>,
        rng: &mut TxRng,
    ) -> Result<ExecOutcome, ExecError> {
        let program: Vec<Instruction> = serde_json::from_slice(&tx.payload)
            .map_err(|e| ExecError::Failed(format!("malformed payload: {}", e)))?;

        let mut run = Run {
            store,
            tx,
            outcome: ExecOutcome {
                status: STATUS_OK,
                ..ExecOutcome::default()
            },
        };
        for instruction in program {
            run.apply(instruction, rng)?;
        }
        Ok(run.outcome)
    }
}

/// Execution state of one transaction
struct Run<'a, S> {
    store: &'a mut S,
    tx: &'a Transaction,
    outcome: ExecOutcome,
}

fn text(value: impl Into<String>) -> Value {
    Value::Text(value.into())
}

fn failed(message: impl Into<String>) -> ExecError {
    ExecError::Failed(message.into())
}

impl<S: Storage> Run<'_, S> {
    fn apply(&mut self, instruction: Instruction, rng: &mut TxRng) -> Result<(), ExecError> {
        match instruction {
            Instruction::Mint { key_id, amount } => {
                self.credit(key_id, amount)?;
            }
            Instruction::Transfer { to, amount } => {
                if amount <= 0 {
                    return Err(failed("transfer amount must be positive"));
                }
                let balance = self.balance(self.tx.key_id)?;
                if balance < amount {
                    return Err(failed(format!(
                        "insufficient funds: key {} holds {}, needs {}",
                        self.tx.key_id, balance, amount
                    )));
                }
                self.credit(self.tx.key_id, -amount)?;
                self.credit(to, amount)?;
            }
            Instruction::SetRow { table, id, values } => {
                let (physical, filter) = resolve(&table, &id)?;
                if self.store.get_row(&physical, &filter)?.is_none() {
                    return Err(failed(format!("row {} not found in {}", id, table)));
                }
                let row = self.store.decode_image(&physical, &values)?;
                self.write(&physical, &filter, row)?;
            }
            Instruction::InsertRow { table, id, values } => {
                let (physical, filter) = resolve(&table, &id)?;
                if self.store.get_row(&physical, &filter)?.is_some() {
                    return Err(failed(format!("row {} already exists in {}", id, table)));
                }
                let row = self.store.decode_image(&physical, &values)?;
                self.write(&physical, &filter, row)?;
            }
            Instruction::CreateTable { name, columns } => {
                self.store.create_table(&name, &columns)?;
                self.log_schema(&SchemaChange::NewTable { name })?;
            }
            Instruction::CreateView { name } => {
                self.store.create_view(&name)?;
                self.log_schema(&SchemaChange::NewView { name })?;
            }
            Instruction::AddColumn { table, column } => {
                self.store.add_column(&table, &column)?;
                self.log_schema(&SchemaChange::NewColumn {
                    table,
                    column: column.name,
                })?;
            }
            Instruction::DropColumn { table, column } => {
                let kind = self.store.column_kind(&table, &column)?;
                // values come back through row entries undone after the column
                for (filter, row) in self.store.table_rows(&table)? {
                    let image = row_image(&row, [&column]);
                    let entry =
                        RollbackEntry::update(self.tx.hash, &table, &filter.table_id(), &image)?;
                    self.outcome.rollback.push(entry);
                }
                self.store.drop_column(&table, &column)?;
                self.log_schema(&SchemaChange::DeleteColumn {
                    table,
                    column,
                    kind,
                })?;
            }
            Instruction::DropTable { name } => {
                let dump = self.store.drop_table(&name)?;
                let rows = dump
                    .rows
                    .iter()
                    .map(|(filter, row)| TableRow {
                        id: filter.id.clone(),
                        ecosystem: filter.ecosystem,
                        values: row_image(row, row.keys()),
                    })
                    .collect();
                self.log_schema(&SchemaChange::DeleteTable {
                    name,
                    columns: dump.columns,
                    rows,
                })?;
            }
            Instruction::NewContract { id, source } => {
                let (table, filter) = self.contract(id)?;
                if self.store.get_row(&table, &filter)?.is_some() {
                    return Err(failed(format!("contract {} already exists", id)));
                }
                let mut row = Row::new();
                row.insert("value".to_string(), text(source));
                row.insert("active".to_string(), text("0"));
                self.store.insert_row(&table, &filter, row)?;
                self.log_schema(&SchemaChange::NewContract {
                    ecosystem: self.tx.ecosystem,
                    id,
                })?;
            }
            Instruction::EditContract { id, source } => {
                let (table, filter) = self.contract(id)?;
                let previous = self.contract_field(&table, &filter, id, "value")?;
                self.store.update_row(
                    &table,
                    &filter,
                    Row::from([("value".to_string(), text(source))]),
                )?;
                self.log_schema(&SchemaChange::EditContract {
                    ecosystem: self.tx.ecosystem,
                    id,
                    source: previous,
                })?;
            }
            Instruction::ActivateContract { id } => {
                self.set_active(id, true)?;
                self.log_schema(&SchemaChange::ActivateContract {
                    ecosystem: self.tx.ecosystem,
                    id,
                })?;
            }
            Instruction::DeactivateContract { id } => {
                self.set_active(id, false)?;
                self.log_schema(&SchemaChange::DeactivateContract {
                    ecosystem: self.tx.ecosystem,
                    id,
                })?;
            }
            Instruction::NewEcosystem { id, name } => {
                let filter = RowFilter::by_id(id.to_string());
                if self.store.get_row(ECOSYSTEMS_TABLE, &filter)?.is_some() {
                    return Err(failed(format!("ecosystem {} already exists", id)));
                }
                self.store.insert_row(
                    ECOSYSTEMS_TABLE,
                    &filter,
                    Row::from([("name".to_string(), text(name))]),
                )?;
                self.log_schema(&SchemaChange::NewEcosystem { id })?;
            }
            Instruction::Random { table, id, column } => {
                let (physical, filter) = resolve(&table, &id)?;
                let value = rng.next_u64().to_string();
                self.write(&physical, &filter, Row::from([(column, text(value))]))?;
            }
            Instruction::Notify { recipient, message } => {
                self.outcome.notifications.push(Notification {
                    tx_hash: self.tx.hash,
                    recipient,
                    message,
                });
            }
            Instruction::Burn { units } => {
                if units > VM_TIME_BUDGET_UNITS {
                    return Err(ExecError::TimeLimit(format!(
                        "{} units over a budget of {}",
                        units, VM_TIME_BUDGET_UNITS
                    )));
                }
            }
            Instruction::Fail { message } => return Err(ExecError::Failed(message)),
            Instruction::StopNetwork => return Err(ExecError::NetworkStopping),
            Instruction::Noop { .. } => {}
        }
        Ok(())
    }

    /// Updates the row if it exists, inserts it otherwise, and records the
    /// matching rollback entry.
    fn write(&mut self, table: &str, filter: &RowFilter, values: Row) -> Result<(), ExecError> {
        let table_id = filter.table_id();
        match self.store.get_row(table, filter)? {
            Some(existing) => {
                let before = row_image(&existing, values.keys());
                let entry = RollbackEntry::update(self.tx.hash, table, &table_id, &before)?;
                self.store.update_row(table, filter, values)?;
                self.outcome.rollback.push(entry);
            }
            None => {
                self.store.insert_row(table, filter, values)?;
                self.outcome
                    .rollback
                    .push(RollbackEntry::insert(self.tx.hash, table, &table_id));
            }
        }
        Ok(())
    }

    fn log_schema(&mut self, change: &SchemaChange) -> Result<(), ExecError> {
        let entry = RollbackEntry::schema(self.tx.hash, change)?;
        self.outcome.rollback.push(entry);
        Ok(())
    }

    fn keys(&self, key_id: i64) -> Result<(String, RowFilter), ExecError> {
        Ok(resolve(
            &format!("{}_keys", self.tx.ecosystem),
            &key_id.to_string(),
        )?)
    }

    fn balance(&self, key_id: i64) -> Result<i64, ExecError> {
        let (table, filter) = self.keys(key_id)?;
        let Some(row) = self.store.get_row(&table, &filter)? else {
            return Ok(0);
        };
        match row.get("amount").and_then(Value::as_text) {
            None | Some("") => Ok(0),
            Some(amount) => amount
                .parse()
                .map_err(|_| failed(format!("key {} holds a malformed amount", key_id))),
        }
    }

    fn credit(&mut self, key_id: i64, amount: i64) -> Result<(), ExecError> {
        let balance = self
            .balance(key_id)?
            .checked_add(amount)
            .ok_or_else(|| failed("amount overflow"))?;
        let (table, filter) = self.keys(key_id)?;
        self.write(
            &table,
            &filter,
            Row::from([("amount".to_string(), text(balance.to_string()))]),
        )?;
        if amount > 0 {
            self.outcome.outputs.push(TxOutput {
                tx_hash: self.tx.hash,
                block_id: 0,
                key_id,
                amount,
            });
        }
        Ok(())
    }

    fn contract(&self, id: i64) -> Result<(String, RowFilter), ExecError> {
        Ok(resolve(
            &format!("{}_contracts", self.tx.ecosystem),
            &id.to_string(),
        )?)
    }

    fn contract_field(
        &self,
        table: &str,
        filter: &RowFilter,
        id: i64,
        column: &str,
    ) -> Result<String, ExecError> {
        self.store
            .get_row(table, filter)?
            .and_then(|row| row.get(column).and_then(Value::as_text).map(str::to_string))
            .ok_or_else(|| failed(format!("contract {} not found", id)))
    }

    fn set_active(&mut self, id: i64, active: bool) -> Result<(), ExecError> {
        let (table, filter) = self.contract(id)?;
        let flag = if active { "1" } else { "0" };
        if self.contract_field(&table, &filter, id, "active")? == flag {
            return Err(failed(format!(
                "contract {} is already {}",
                id,
                if active { "active" } else { "inactive" }
            )));
        }
        self.store
            .update_row(&table, &filter, Row::from([("active".to_string(), text(flag))]))?;
        Ok(())
    }
}
