//! Entry points used by the node: inserting received blocks, producing
//! blocks in this node's slot, and rolling the chain back.

use std::sync::Arc;
use std::time::Instant;

use tessera_common::config::ConsensusMode;
use tessera_common::hashing::ZERO_HASH;
use tessera_common::types::{Block, BlockHeader, Transaction, BLOCK_VERSION, GENESIS_HEIGHT};
use tracing::{debug, error, info, warn};

use crate::consensus::{BlockTimeCalculator, ConsensusError};
use crate::context::NodeContext;
use crate::error::{ChainError, ChainResult};
use crate::limits::{LimitError, LimitMode, Limits};
use crate::playback::{BlockPlayer, PlayMode};
use crate::ports::{BlockSigner, SignatureVerifier, TxExecutor};
use crate::rollback;
use crate::storage::{BlockRecord, InfoBlock, Storage};
use crate::validation::BlockValidator;

/// One node's view of the chain. Every method that plays or unwinds blocks
/// takes `&mut self`, so blocks are processed one at a time.
pub struct Chain<S, E> {
    ctx: Arc<NodeContext>,
    store: S,
    executor: E,
    signer: Box<dyn BlockSigner + Send>,
    verifier: Box<dyn SignatureVerifier + Send + Sync>,
}

impl<S, E> Chain<S, E>
where
    S: Storage,
    E: TxExecutor<S>,
{
    pub fn new(
        ctx: Arc<NodeContext>,
        store: S,
        executor: E,
        signer: Box<dyn BlockSigner + Send>,
        verifier: Box<dyn SignatureVerifier + Send + Sync>,
    ) -> Self {
        Self {
            ctx,
            store,
            executor,
            signer,
            verifier,
        }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn head(&self) -> ChainResult<Option<InfoBlock>> {
        Ok(self.store.info_block()?)
    }

    /// Builds and signs an empty genesis block from this node's parameters.
    pub fn genesis_block(&mut self) -> Block {
        let params = self.ctx.params();
        let header = BlockHeader {
            height: GENESIS_HEIGHT,
            time: params.first_block_time,
            ecosystem_id: params.ecosystem,
            key_id: params.key_id,
            node_position: params.node_position,
            ..BlockHeader::default()
        };
        let mut block = Block::new(header, Vec::new());
        block.header.signature = self.signer.sign(&block.hash());
        block
    }

    /// Applies a locally built genesis block when the chain is empty.
    pub fn init_genesis(&mut self) -> ChainResult<Option<BlockRecord>> {
        if self.head()?.is_some() {
            return Ok(None);
        }
        let raw = self.genesis_block().encode()?;
        self.insert_block_without_forks(&raw, true).map(Some)
    }

    /// Decodes, validates and plays a block received from the network (or
    /// the genesis block when `first_block` is set), making it the new head.
    pub fn insert_block_without_forks(
        &mut self,
        raw: &[u8],
        first_block: bool,
    ) -> ChainResult<BlockRecord> {
        let result = self.insert_block(raw, first_block);
        if let Err(err) = &result {
            if err.is_duplicate_slot() {
                warn!(%err, "block rejected");
            } else {
                error!(%err, "block rejected");
            }
        }
        result
    }

    fn insert_block(&mut self, raw: &[u8], first_block: bool) -> ChainResult<BlockRecord> {
        let mut block = Block::decode(raw)?;
        let head = self.store.info_block()?;

        match (&head, first_block) {
            (None, true) if block.is_genesis() => {}
            (_, true) => {
                return Err(ChainError::Structural(
                    "first block must be a genesis block on an empty chain".to_string(),
                ))
            }
            (None, false) => {
                return Err(ChainError::Structural(
                    "chain has no genesis block".to_string(),
                ))
            }
            (Some(head), false) if head.height + 1 != block.header.height => {
                return Err(ChainError::Structural(format!(
                    "block {} does not extend head {}",
                    block.header.height, head.height
                )))
            }
            (Some(_), false) => {}
        }

        BlockValidator::new(&self.ctx, self.verifier.as_ref()).validate(
            &mut self.store,
            &mut block,
            None,
        )?;

        BlockPlayer::new(&self.ctx).play(
            &mut self.store,
            &mut self.executor,
            &mut block,
            PlayMode::Parse,
            Instant::now(),
        )
    }

    /// Produces a block if this node holds the current slot and has
    /// transactions to include. `Ok(None)` means there was nothing to do.
    pub fn generate_block(&mut self) -> ChainResult<Option<BlockRecord>> {
        if let Some(reason) = self.ctx.paused() {
            debug!(?reason, "node paused, not generating");
            return Ok(None);
        }

        let params = self.ctx.params();
        let head = self
            .store
            .info_block()?
            .ok_or_else(|| ChainError::Structural("chain has no genesis block".to_string()))?;
        let now = self.ctx.now();

        match params.mode {
            ConsensusMode::RoundRobin => {
                let calc = BlockTimeCalculator::from_context(&self.ctx);
                match calc.time_to_generate(now, params.node_position, &self.store) {
                    Ok(true) => {}
                    Ok(false) => return Ok(None),
                    Err(ConsensusError::DuplicateBlock { .. }) => {
                        debug!(now, "block for this slot already produced");
                        return Ok(None);
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            ConsensusMode::SingleNode => {
                if now < head.time + params.slot_duration_secs() as i64 {
                    return Ok(None);
                }
            }
        }

        let started = Instant::now();
        let candidates = self.preprocess(now, started)?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let header = BlockHeader {
            height: head.height + 1,
            time: now,
            ecosystem_id: params.ecosystem,
            key_id: params.key_id,
            node_position: params.node_position,
            version: BLOCK_VERSION,
            prev_hash: head.hash,
            merkle_root: ZERO_HASH,
            prev_rollbacks_hash: head.rollbacks_hash,
            signature: Vec::new(),
        };
        let mut block = Block::new(header, candidates);

        let record = BlockPlayer::new(&self.ctx)
            .with_signer(self.signer.as_mut())
            .play(
                &mut self.store,
                &mut self.executor,
                &mut block,
                PlayMode::Generate,
                started,
            )
            .map_err(|err| {
                error!(height = head.height + 1, %err, "block generation failed");
                err
            })?;

        for tx in &block.transactions {
            self.store.dequeue_tx(&tx.hash)?;
        }
        Ok(Some(record))
    }

    /// Picks the queued transactions worth trying, in queue order.
    fn preprocess(&mut self, now: i64, started: Instant) -> ChainResult<Vec<Transaction>> {
        let params = self.ctx.params();
        let mut limits = Limits::new(LimitMode::PREPROCESS, &params.limits, started);
        let mut candidates = Vec::new();

        for tx in self.store.queued_txs()? {
            if self.ctx.is_banned(tx.key_id) {
                debug!(tx = %tx.short_hash(), key_id = tx.key_id, "originator banned");
                continue;
            }
            if self.store.bad_tx(&tx.hash)?.is_some() || self.store.is_committed(&tx.hash)? {
                self.store.dequeue_tx(&tx.hash)?;
                continue;
            }
            if let Err(err) = tx.check(now) {
                warn!(tx = %tx.short_hash(), %err, "dropping queued transaction");
                self.store.mark_bad_tx(&tx.hash, &err.to_string())?;
                self.store.dequeue_tx(&tx.hash)?;
                continue;
            }

            match limits.check(&tx, &self.store) {
                Ok(()) => candidates.push(tx),
                Err(LimitError::Stop) => break,
                Err(LimitError::Skip) => continue,
                Err(err) => {
                    self.store.mark_bad_tx(&tx.hash, &err.to_string())?;
                    self.store.dequeue_tx(&tx.hash)?;
                }
            }
        }
        Ok(candidates)
    }

    /// Unwinds blocks until `height` is the head.
    pub fn rollback_to_height(&mut self, height: i64) -> ChainResult<()> {
        info!(height, "rolling back");
        rollback::rollback_to_height(&mut self.store, &self.ctx, height)
    }

    /// Whether `node_position` holds the slot at the current time.
    pub fn time_to_generate(&self, node_position: i64) -> ChainResult<bool> {
        let calc = BlockTimeCalculator::from_context(&self.ctx);
        Ok(calc.time_to_generate(self.ctx.now(), node_position, &self.store)?)
    }

    /// Whether a block by `node_position` at `time` would be in its slot.
    pub fn validate_block_slot(&self, node_position: i64, time: i64) -> ChainResult<bool> {
        let calc = BlockTimeCalculator::from_context(&self.ctx);
        Ok(calc.validate_block(node_position, time, &self.store)?)
    }

    pub fn enqueue_transaction(&mut self, tx: Transaction) -> ChainResult<()> {
        debug!(tx = %tx.short_hash(), "queued transaction");
        self.store.enqueue_tx(tx)?;
        Ok(())
    }
}
