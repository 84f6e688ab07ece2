//! Unwinds applied blocks from the head down to a target height.
//!
//! Each block is undone inside its own storage transaction: transactions in
//! reverse order, and within a transaction its rollback entries in reverse
//! recording order. A failure aborts that block's transaction, so the head
//! stays on the last block that was fully rolled back. The unwound
//! transactions go back into the queue.

mod schema;

use tessera_common::types::{Block, RollbackEntry};
use tracing::{error, info};

use crate::context::NodeContext;
use crate::error::{ChainError, ChainResult};
use crate::storage::{resolve, InfoBlock, Storage};

fn consistency(err: impl std::fmt::Display) -> ChainError {
    ChainError::RollbackConsistency(err.to_string())
}

/// Rolls the chain back until `target` is the head.
pub fn rollback_to_height<S: Storage>(
    store: &mut S,
    ctx: &NodeContext,
    target: i64,
) -> ChainResult<()> {
    if target < 1 {
        return Err(ChainError::Structural(format!(
            "cannot roll back below the genesis block (target {})",
            target
        )));
    }

    loop {
        let Some(head) = store.info_block()? else {
            return Err(consistency("chain has no head"));
        };
        if head.height <= target {
            info!(height = head.height, "rollback finished");
            return Ok(());
        }

        let record = store
            .block_by_height(head.height)?
            .ok_or_else(|| consistency(format!("head block {} is not stored", head.height)))?;
        let block = Block::decode(&record.data).map_err(consistency)?;
        rollback_block(store, ctx, &block)?;
    }
}

/// Undoes the chain head `block` and moves the head to its predecessor.
pub fn rollback_block<S: Storage>(store: &mut S, ctx: &NodeContext, block: &Block) -> ChainResult<()> {
    let height = block.header.height;
    let head = store.info_block()?.ok_or_else(|| consistency("chain has no head"))?;
    if head.height != height || head.hash != block.hash() {
        return Err(ChainError::NotHead {
            height,
            head: head.height,
        });
    }
    if block.is_genesis() {
        return Err(ChainError::Structural(
            "the genesis block cannot be rolled back".to_string(),
        ));
    }

    store.begin()?;
    match undo_block(store, block) {
        Ok(()) => store.commit()?,
        Err(err) => {
            if let Err(abort_err) = store.abort() {
                error!(%abort_err, "failed to abort rollback transaction");
            }
            error!(height, %err, "block rollback failed");
            return Err(err);
        }
    }

    ctx.invalidate_checked(block.transactions.iter().map(|tx| &tx.hash));
    info!(height, hash = %block.short_hash(), txs = block.transactions.len(), "block rolled back");
    Ok(())
}

fn undo_block<S: Storage>(store: &mut S, block: &Block) -> ChainResult<()> {
    let height = block.header.height;

    for tx in block.transactions.iter().rev() {
        store.reset_tx_status(&tx.hash)?;
        store.delete_log_record(&tx.hash)?;
        store.delete_notifications(&tx.hash)?;

        let entries = store.rollback_entries(&tx.hash)?;
        for entry in entries.iter().rev() {
            undo_entry(store, entry)?;
        }
        store.delete_rollback_entries(&tx.hash)?;

        // eligible for a later block again
        store.enqueue_tx(tx.clone())?;
    }

    store.delete_block_outputs(height)?;
    store.delete_block(height)?;

    let prev = store
        .block_by_height(height - 1)?
        .ok_or_else(|| consistency(format!("block {} is not stored", height - 1)))?;
    store.set_info_block(InfoBlock::from(&prev))?;
    Ok(())
}

/// Reverts one recorded mutation: deletes inserted rows, restores
/// before-images, and dispatches schema changes.
fn undo_entry<S: Storage>(store: &mut S, entry: &RollbackEntry) -> ChainResult<()> {
    if entry.is_schema() {
        let change = entry.schema_change().map_err(consistency)?;
        return schema::undo(store, &change).map_err(consistency);
    }

    let (table, filter) = resolve(&entry.table_name, &entry.table_id).map_err(consistency)?;
    match entry.before_image().map_err(consistency)? {
        None => store.delete_row(&table, &filter).map_err(consistency),
        Some(image) => {
            let values = store.decode_image(&table, &image).map_err(consistency)?;
            store.update_row(&table, &filter, values).map_err(consistency)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ManualClock, SystemParameters};
    use crate::storage::{
        BlockRecord, ChainStore, MemoryStore, Row, RowFilter, StateTables, TxStatusRecord, Value,
    };
    use std::sync::Arc;
    use tessera_common::hashing::ZERO_HASH;
    use tessera_common::types::{BlockHeader, RowImage, Transaction, TxKind};

    fn context() -> NodeContext {
        NodeContext::new(SystemParameters::default(), Vec::new(), Arc::new(ManualClock::new(0)))
    }

    fn store_block(store: &mut MemoryStore, block: &Block) {
        let record = BlockRecord {
            height: block.header.height,
            hash: block.hash(),
            data: block.encode().unwrap(),
            rollbacks_hash: ZERO_HASH,
            time: block.header.time,
            node_position: 0,
            key_id: 1,
            ecosystem_id: 1,
            tx_count: block.transactions.len(),
        };
        store.insert_block(record.clone()).unwrap();
        store.set_info_block(InfoBlock::from(&record)).unwrap();
    }

    fn chain_of_two(txs: Vec<Transaction>) -> (MemoryStore, Block) {
        let mut store = MemoryStore::with_first_tables();
        store_block(&mut store, &Block::new(BlockHeader::default(), Vec::new()));
        let header = BlockHeader {
            height: 2,
            time: 10,
            ..BlockHeader::default()
        };
        (store, Block::new(header, txs))
    }

    fn amount(value: &str) -> Row {
        Row::from([("amount".to_string(), Value::Text(value.to_string()))])
    }

    #[test]
    fn test_update_undone_before_insert() {
        let tx = Transaction::new(1, 1, TxKind::Transfer, 10, 1, b"[]".to_vec());
        let (mut store, block) = chain_of_two(vec![tx.clone()]);
        let before = store.state_snapshot();
        let key = RowFilter::in_ecosystem("5", 1);

        // insert then update of the same row, as the executor would log them
        store.insert_row("1_keys", &key, amount("10")).unwrap();
        let mut image = RowImage::new();
        image.insert("amount".to_string(), "10".to_string());
        store.update_row("1_keys", &key, amount("15")).unwrap();
        store
            .append_rollback(&[
                RollbackEntry::insert(tx.hash, "1_keys", "5,1"),
                RollbackEntry::update(tx.hash, "1_keys", "5,1", &image).unwrap(),
            ])
            .unwrap();
        store
            .set_tx_status(TxStatusRecord {
                hash: tx.hash,
                block_id: 2,
                used: true,
                status: 1,
            })
            .unwrap();
        store_block(&mut store, &block);

        rollback_to_height(&mut store, &context(), 1).unwrap();

        assert!(!store.is_committed(&tx.hash).unwrap());
        assert_eq!(store.queued_txs().unwrap(), vec![tx.clone()]);
        store.dequeue_tx(&tx.hash).unwrap();
        assert_eq!(store.state_snapshot(), before);
    }

    #[test]
    fn test_only_head_can_be_rolled_back() {
        let (mut store, block) = chain_of_two(Vec::new());
        let err = rollback_block(&mut store, &context(), &block).unwrap_err();
        assert!(matches!(err, ChainError::NotHead { height: 2, head: 1 }));
    }

    #[test]
    fn test_bad_image_aborts_block() {
        let tx = Transaction::new(1, 1, TxKind::Transfer, 10, 1, b"[]".to_vec());
        let (mut store, block) = chain_of_two(vec![tx.clone()]);
        let key = RowFilter::in_ecosystem("5", 1);
        store.insert_row("1_keys", &key, amount("10")).unwrap();

        let mut image = RowImage::new();
        image.insert("pub".to_string(), "not hex".to_string());
        store
            .append_rollback(&[RollbackEntry::update(tx.hash, "1_keys", "5,1", &image).unwrap()])
            .unwrap();
        store_block(&mut store, &block);
        let before = store.state_snapshot();

        let err = rollback_to_height(&mut store, &context(), 1).unwrap_err();
        assert!(matches!(err, ChainError::RollbackConsistency(_)));
        assert_eq!(store.state_snapshot(), before);
        assert_eq!(store.info_block().unwrap().map(|info| info.height), Some(2));
    }

    #[test]
    fn test_target_at_or_above_head_is_noop() {
        let (mut store, block) = chain_of_two(Vec::new());
        store_block(&mut store, &block);
        let before = store.state_snapshot();

        rollback_to_height(&mut store, &context(), 5).unwrap();
        assert_eq!(store.state_snapshot(), before);
        assert!(matches!(
            rollback_to_height(&mut store, &context(), 0),
            Err(ChainError::Structural(_))
        ));
    }
}
