use std::collections::{HashMap, HashSet};

use tessera_common::config::ConsensusMode;
use tessera_common::hashing::short_hex;
use tessera_common::types::{rollback_digest, Block, BlockHeader, TxCheckError};
use tracing::{debug, error};

use crate::consensus::BlockTimeCalculator;
use crate::context::NodeContext;
use crate::error::{ChainError, ChainResult};
use crate::ports::{HonorNodeRegistry, SignatureVerifier};
use crate::storage::Storage;

/// Decides whether a received block is legal before it is played
pub struct BlockValidator<'a> {
    ctx: &'a NodeContext,
    verifier: &'a dyn SignatureVerifier,
}

impl<'a> BlockValidator<'a> {
    pub fn new(ctx: &'a NodeContext, verifier: &'a dyn SignatureVerifier) -> Self {
        Self { ctx, verifier }
    }

    /// Validates `block` against its predecessor, fetched from `store` when
    /// `prev` is not supplied.
    ///
    /// Transactions failing their own checks are removed from the block and
    /// marked bad; the block is then rejected with
    /// [`ChainError::TransactionCheckFailed`].
    pub fn validate<S: Storage>(
        &self,
        store: &mut S,
        block: &mut Block,
        prev: Option<&BlockHeader>,
    ) -> ChainResult<()> {
        if block.is_genesis() {
            return Ok(());
        }

        let height = block.header.height;
        let fetched;
        let prev = match prev {
            Some(prev) => prev,
            None => {
                fetched = self.fetch_header(store, height - 1)?;
                &fetched
            }
        };

        if prev.height + 1 != height {
            return Err(ChainError::Structural(format!(
                "block {} does not follow {}",
                height, prev.height
            )));
        }
        if block.header.prev_hash != prev.hash() {
            return Err(ChainError::Structural(format!(
                "block {} does not link to the hash of block {}",
                height, prev.height
            )));
        }

        let now = self.ctx.now();
        if block.header.time > now {
            return Err(ChainError::Temporal(format!(
                "block {} time {} is in the future (now {})",
                height, block.header.time, now
            )));
        }
        if block.header.time < prev.time {
            return Err(ChainError::Temporal(format!(
                "block {} time {} precedes block {} time {}",
                height, block.header.time, prev.height, prev.time
            )));
        }

        let params = self.ctx.params();
        if params.mode == ConsensusMode::RoundRobin {
            let calc = BlockTimeCalculator::from_context(self.ctx);
            if !calc.validate_block(block.header.node_position, block.header.time, &*store)? {
                return Err(ChainError::WrongProducer {
                    height,
                    node_position: block.header.node_position,
                });
            }
        }

        let expected = rollback_digest(&store.block_rollback_entries(prev.height)?);
        if block.header.prev_rollbacks_hash != expected {
            return Err(ChainError::Structural(format!(
                "rollback digest of block {} is {}, block {} expects {}",
                prev.height,
                short_hex(&expected),
                height,
                short_hex(&block.header.prev_rollbacks_hash)
            )));
        }

        self.check_transactions(store, block, params.limits.max_tx_per_user)?;
        self.check_signature(block, params.mode)
    }

    fn fetch_header<S: Storage>(&self, store: &S, height: i64) -> ChainResult<BlockHeader> {
        let record = store.block_by_height(height)?.ok_or_else(|| {
            ChainError::Structural(format!("previous block {} not found", height))
        })?;
        Ok(Block::decode(&record.data)?.header)
    }

    fn check_transactions<S: Storage>(
        &self,
        store: &mut S,
        block: &mut Block,
        max_tx_per_user: u64,
    ) -> ChainResult<()> {
        let height = block.header.height;
        // time windows are judged against the block, not the local clock
        let block_time = block.header.time;
        let mut seen = HashSet::new();
        let mut per_user: HashMap<i64, u64> = HashMap::new();
        let mut failed = Vec::new();

        for tx in &block.transactions {
            if !seen.insert(tx.hash) {
                return Err(ChainError::Structural(format!(
                    "duplicate transaction {} in block {}",
                    tx.short_hash(),
                    height
                )));
            }

            let count = per_user.entry(tx.key_id).or_insert(0);
            *count += 1;
            if *count > max_tx_per_user {
                self.ctx.ban(tx.key_id);
                return Err(ChainError::UserLimit {
                    key_id: tx.key_id,
                    limit: max_tx_per_user,
                });
            }

            let checked = if store.is_committed(&tx.hash)? {
                Err(TxCheckError::AlreadyCommitted(tx.short_hash()))
            } else if self.ctx.is_checked(&tx.hash) {
                continue;
            } else {
                tx.check(block_time)
            };
            match checked {
                Ok(()) => self.ctx.mark_checked(tx.hash),
                Err(err) => {
                    error!(tx = %tx.short_hash(), height, %err, "transaction check failed");
                    store.mark_bad_tx(&tx.hash, &err.to_string())?;
                    failed.push(tx.hash);
                }
            }
        }

        if failed.is_empty() {
            return Ok(());
        }
        block.transactions.retain(|tx| !failed.contains(&tx.hash));
        Err(ChainError::TransactionCheckFailed {
            height,
            failed: failed.len(),
        })
    }

    fn check_signature(&self, block: &Block, mode: ConsensusMode) -> ChainResult<()> {
        if mode == ConsensusMode::SingleNode {
            debug!(height = block.header.height, "single node, signature not checked");
            return Ok(());
        }

        let height = block.header.height;
        let valid = self
            .ctx
            .node_at(block.header.node_position)
            .map_or(false, |node| {
                self.verifier.verify(
                    &node.public_key,
                    &block.hash(),
                    &block.header.signature,
                )
            });
        if !valid {
            // A fork may reuse these hashes with different results
            self.ctx.invalidate_checked(block.transactions.iter().map(|tx| &tx.hash));
            return Err(ChainError::Signature { height });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{HonorNode, ManualClock, SystemParameters};
    use crate::storage::{BlockRecord, ChainStore, MemoryStore, TxStatusRecord};
    use std::sync::Arc;
    use tessera_common::hashing::ZERO_HASH;
    use tessera_common::types::{Transaction, TxKind};

    const GENESIS_TIME: i64 = 1_000;
    const NOW: i64 = 1_005;

    /// Accepts signatures equal to the public key followed by the message
    struct EchoVerifier;

    impl SignatureVerifier for EchoVerifier {
        fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
            signature == [public_key, message].concat().as_slice()
        }
    }

    fn context(mode: ConsensusMode) -> NodeContext {
        context_at(mode, NOW)
    }

    fn context_at(mode: ConsensusMode, now: i64) -> NodeContext {
        let mut params = SystemParameters::default();
        params.mode = mode;
        params.first_block_time = GENESIS_TIME;
        params.generation_time_secs = 8;
        params.blocks_gap_secs = 2;
        params.limits.max_tx_per_user = 2;
        NodeContext::new(
            params,
            vec![HonorNode {
                key_id: 1,
                public_key: vec![0xAA; 4],
                address: String::new(),
                stopped: false,
            }],
            Arc::new(ManualClock::new(now)),
        )
    }

    fn store_with_genesis() -> (MemoryStore, BlockHeader) {
        let genesis = Block::new(
            BlockHeader {
                time: GENESIS_TIME,
                ..Default::default()
            },
            Vec::new(),
        );
        let mut store = MemoryStore::with_first_tables();
        store
            .insert_block(BlockRecord {
                height: 1,
                hash: genesis.hash(),
                data: genesis.encode().unwrap(),
                rollbacks_hash: ZERO_HASH,
                time: GENESIS_TIME,
                node_position: 0,
                key_id: 1,
                ecosystem_id: 1,
                tx_count: 0,
            })
            .unwrap();
        (store, genesis.header)
    }

    fn tx(key_id: i64, time: i64) -> Transaction {
        Transaction::new(key_id, 1, TxKind::Transfer, time, 1, format!("{}", key_id).into_bytes())
    }

    fn next_block(prev: &BlockHeader, txs: Vec<Transaction>) -> Block {
        let mut block = Block::new(
            BlockHeader {
                height: prev.height + 1,
                time: NOW,
                prev_hash: prev.hash(),
                ..Default::default()
            },
            txs,
        );
        block.header.signature = [&[0xAA; 4][..], &block.hash()[..]].concat();
        block
    }

    #[test]
    fn test_genesis_is_exempt() {
        let ctx = context(ConsensusMode::RoundRobin);
        let mut store = MemoryStore::new();
        let mut genesis = Block::new(BlockHeader::default(), Vec::new());
        genesis.header.time = NOW + 1_000;
        assert!(BlockValidator::new(&ctx, &EchoVerifier)
            .validate(&mut store, &mut genesis, None)
            .is_ok());
    }

    #[test]
    fn test_missing_predecessor() {
        let ctx = context(ConsensusMode::SingleNode);
        let (_, genesis) = store_with_genesis();
        let mut store = MemoryStore::new();
        let mut block = next_block(&genesis, vec![tx(1, NOW)]);

        let result = BlockValidator::new(&ctx, &EchoVerifier).validate(&mut store, &mut block, None);
        assert!(matches!(result, Err(ChainError::Structural(msg)) if msg.contains("not found")));
    }

    #[test]
    fn test_valid_block_passes() {
        let ctx = context(ConsensusMode::RoundRobin);
        let (mut store, genesis) = store_with_genesis();
        let mut block = next_block(&genesis, vec![tx(1, NOW), tx(2, NOW)]);

        BlockValidator::new(&ctx, &EchoVerifier)
            .validate(&mut store, &mut block, None)
            .unwrap();
        assert!(ctx.is_checked(&block.transactions[0].hash));
    }

    #[test]
    fn test_future_block_rejected() {
        let ctx = context(ConsensusMode::SingleNode);
        let (mut store, genesis) = store_with_genesis();
        let mut block = next_block(&genesis, vec![tx(1, NOW)]);
        block.header.time = NOW + 1;

        let result = BlockValidator::new(&ctx, &EchoVerifier).validate(&mut store, &mut block, None);
        assert!(matches!(result, Err(ChainError::Temporal(_))));
    }

    #[test]
    fn test_duplicate_transactions_rejected() {
        let ctx = context(ConsensusMode::SingleNode);
        let (mut store, genesis) = store_with_genesis();
        let mut block = next_block(&genesis, vec![tx(1, NOW), tx(1, NOW)]);

        let result = BlockValidator::new(&ctx, &EchoVerifier).validate(&mut store, &mut block, None);
        assert!(matches!(result, Err(ChainError::Structural(msg)) if msg.contains("duplicate")));
        assert_eq!(block.transactions.len(), 2);
    }

    #[test]
    fn test_user_limit_bans_key() {
        let ctx = context(ConsensusMode::SingleNode);
        let (mut store, genesis) = store_with_genesis();
        let txs = (0..3).map(|i| tx(7, NOW - i)).collect();
        let mut block = next_block(&genesis, txs);

        let result = BlockValidator::new(&ctx, &EchoVerifier).validate(&mut store, &mut block, None);
        assert!(matches!(result, Err(ChainError::UserLimit { key_id: 7, limit: 2 })));
        assert!(ctx.is_banned(7));
    }

    #[test]
    fn test_failed_transaction_removed_and_marked_bad() {
        let ctx = context(ConsensusMode::SingleNode);
        let (mut store, genesis) = store_with_genesis();
        let stale = tx(2, NOW - 100_000);
        let mut block = next_block(&genesis, vec![tx(1, NOW), stale.clone(), tx(3, NOW)]);

        let result = BlockValidator::new(&ctx, &EchoVerifier).validate(&mut store, &mut block, None);
        assert!(matches!(
            result,
            Err(ChainError::TransactionCheckFailed { height: 2, failed: 1 })
        ));
        assert_eq!(block.transactions.len(), 2);
        assert!(store.bad_tx(&stale.hash).unwrap().is_some());
    }

    #[test]
    fn test_bad_signature_invalidates_cache() {
        let ctx = context(ConsensusMode::RoundRobin);
        let (mut store, genesis) = store_with_genesis();
        let mut block = next_block(&genesis, vec![tx(1, NOW)]);
        block.header.signature = vec![0; 8];

        let result = BlockValidator::new(&ctx, &EchoVerifier).validate(&mut store, &mut block, None);
        assert!(matches!(result, Err(ChainError::Signature { height: 2 })));
        assert!(!ctx.is_checked(&block.transactions[0].hash));

        // single node mode does not look at signatures
        let ctx = context(ConsensusMode::SingleNode);
        assert!(BlockValidator::new(&ctx, &EchoVerifier)
            .validate(&mut store, &mut block, None)
            .is_ok());
    }

    #[test]
    fn test_rollback_digest_mismatch() {
        let ctx = context(ConsensusMode::SingleNode);
        let (mut store, genesis) = store_with_genesis();
        let mut block = next_block(&genesis, vec![tx(1, NOW)]);
        block.header.prev_rollbacks_hash = [1; 32];

        let result = BlockValidator::new(&ctx, &EchoVerifier).validate(&mut store, &mut block, None);
        assert!(matches!(result, Err(ChainError::Structural(msg)) if msg.contains("rollback digest")));
    }

    #[test]
    fn test_duplicate_slot_detected() {
        let ctx = context(ConsensusMode::RoundRobin);
        let (mut store, genesis) = store_with_genesis();
        let mut block = next_block(&genesis, vec![tx(1, NOW)]);
        store
            .insert_block(BlockRecord {
                height: 2,
                hash: [2; 32],
                data: Vec::new(),
                rollbacks_hash: ZERO_HASH,
                time: NOW - 1,
                node_position: 0,
                key_id: 1,
                ecosystem_id: 1,
                tx_count: 1,
            })
            .unwrap();

        let err = BlockValidator::new(&ctx, &EchoVerifier)
            .validate(&mut store, &mut block, Some(&genesis))
            .unwrap_err();
        assert!(err.is_duplicate_slot());
    }

    #[test]
    fn test_committed_transaction_rejected_even_when_cached() {
        let ctx = context(ConsensusMode::SingleNode);
        let (mut store, genesis) = store_with_genesis();
        let replayed = tx(1, NOW);
        ctx.mark_checked(replayed.hash);
        store
            .set_tx_status(TxStatusRecord {
                hash: replayed.hash,
                block_id: 1,
                used: true,
                status: 1,
            })
            .unwrap();
        let mut block = next_block(&genesis, vec![replayed.clone(), tx(2, NOW)]);

        let result = BlockValidator::new(&ctx, &EchoVerifier).validate(&mut store, &mut block, None);
        assert!(matches!(
            result,
            Err(ChainError::TransactionCheckFailed { height: 2, failed: 1 })
        ));
        assert!(store.bad_tx(&replayed.hash).unwrap().is_some());
    }

    #[test]
    fn test_old_block_validated_at_its_own_time() {
        // a node catching up a day and more later
        let ctx = context_at(ConsensusMode::SingleNode, NOW + 200_000);
        let (mut store, genesis) = store_with_genesis();
        let mut block = next_block(&genesis, vec![tx(1, NOW), tx(2, NOW - 10)]);

        BlockValidator::new(&ctx, &EchoVerifier)
            .validate(&mut store, &mut block, None)
            .unwrap();
        assert_eq!(block.transactions.len(), 2);
    }
}
