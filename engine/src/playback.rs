//! Executes a block's transactions inside one storage transaction and
//! persists the result.
//!
//! Every transaction runs under its own savepoint, so a failing transaction
//! is undone without losing the ones before it. What happens next depends on
//! the failure and on whether the block is being generated locally or parsed
//! from the network.

use std::time::Instant;

use tessera_common::config::ConsensusMode;
use tessera_common::hashing::{short_hex, Hash32};
use tessera_common::types::{rollback_digest, Block, RollbackEntry, Transaction};
use tracing::{debug, error, info, warn};

use crate::consensus::BlockTimeCalculator;
use crate::context::{NodeContext, PauseReason};
use crate::error::{ChainError, ChainResult};
use crate::limits::{LimitError, LimitMode, Limits};
use crate::ports::{BlockSigner, ExecContext, ExecError, ExecOutcome, TxExecutor};
use crate::seed::tx_rng;
use crate::storage::{BlockRecord, InfoBlock, Notification, Storage, TxOutput, TxStatusRecord};

/// Error text recorded for every VM time-limit failure
pub const ERR_VM_TIME_LIMIT: &str = "Time limit exceeded";

/// Why the block is being played
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayMode {
    /// This node assembles and signs the block
    Generate,
    /// The block was received or is the genesis block
    Parse,
}

impl PlayMode {
    fn limit_mode(self) -> LimitMode {
        match self {
            PlayMode::Generate => LimitMode::GENERATE,
            PlayMode::Parse => LimitMode::PARSE,
        }
    }
}

/// Effects applied after the block's storage transaction ends, whether it
/// committed or not.
#[derive(Debug, Default)]
struct Quarantine {
    bad: Vec<(Hash32, String)>,
    bans: Vec<i64>,
}

enum TxFailure {
    Limit(LimitError),
    Exec(ExecError),
}

/// Aggregated side effects of the accepted transactions
#[derive(Debug, Default)]
struct Played {
    statuses: Vec<(Hash32, i64)>,
    rollback: Vec<RollbackEntry>,
    notifications: Vec<Notification>,
    outputs: Vec<TxOutput>,
}

impl Played {
    fn absorb(&mut self, tx: &Transaction, outcome: ExecOutcome) {
        self.statuses.push((tx.hash, outcome.status));
        self.rollback.extend(outcome.rollback);
        self.notifications.extend(outcome.notifications);
        self.outputs.extend(outcome.outputs);
    }
}

/// Plays blocks for one node. Only one block is played at a time.
pub struct BlockPlayer<'a> {
    ctx: &'a NodeContext,
    signer: Option<&'a mut dyn BlockSigner>,
}

impl<'a> BlockPlayer<'a> {
    pub fn new(ctx: &'a NodeContext) -> Self {
        Self { ctx, signer: None }
    }

    /// Signs generated blocks once their transaction list is final
    pub fn with_signer(mut self, signer: &'a mut dyn BlockSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Plays `block` and persists it as the new chain head.
    ///
    /// In [`PlayMode::Generate`] the block's transaction list may be
    /// truncated or filtered; the block is then re-sealed and signed before
    /// it is stored.
    pub fn play<S, E>(
        &mut self,
        store: &mut S,
        executor: &mut E,
        block: &mut Block,
        mode: PlayMode,
        started: Instant,
    ) -> ChainResult<BlockRecord>
    where
        S: Storage,
        E: TxExecutor<S>,
    {
        let prev = store.info_block()?;
        let mut quarantine = Quarantine::default();

        store.begin()?;
        let result = self
            .play_transactions(store, executor, block, mode, prev.as_ref(), started, &mut quarantine)
            .and_then(|played| self.persist(store, block, mode, played));

        let result = match result {
            Ok(record) => store.commit().map(|_| record).map_err(ChainError::from),
            Err(err) => {
                if let Err(abort_err) = store.abort() {
                    error!(%abort_err, "failed to abort block transaction");
                }
                Err(err)
            }
        };
        if result.is_ok() {
            // committed hashes are caught by their status from now on
            self.ctx
                .invalidate_checked(block.transactions.iter().map(|tx| &tx.hash));
        }

        let quarantined = self.apply_quarantine(store, quarantine);
        settle(block.header.height, result, quarantined)
    }

    #[allow(clippy::too_many_arguments)]
    fn play_transactions<S, E>(
        &mut self,
        store: &mut S,
        executor: &mut E,
        block: &mut Block,
        mode: PlayMode,
        prev: Option<&InfoBlock>,
        started: Instant,
        quarantine: &mut Quarantine,
    ) -> ChainResult<Played>
    where
        S: Storage,
        E: TxExecutor<S>,
    {
        let params = self.ctx.params();
        let generating = mode == PlayMode::Generate;
        let mut limits = Limits::new(mode.limit_mode(), &params.limits, started);
        let mut played = Played::default();
        let mut accepted = Vec::new();

        let candidates = std::mem::take(&mut block.transactions);
        let exec_ctx = ExecContext {
            header: &block.header,
            prev,
            generating,
        };

        for (index, tx) in candidates.into_iter().enumerate() {
            let savepoint = format!("tx-{}", index);
            store.savepoint(&savepoint)?;

            let result = limits
                .check(&tx, &*store)
                .map_err(TxFailure::Limit)
                .and_then(|_| {
                    let mut rng = tx_rng(exec_ctx.header.time, &tx.hash);
                    executor
                        .execute(store, &tx, &exec_ctx, &mut rng)
                        .map_err(TxFailure::Exec)
                });

            let failure = match result {
                Ok(outcome) => {
                    store.release_savepoint(&savepoint)?;
                    debug!(tx = %tx.short_hash(), entries = outcome.rollback.len(), "transaction applied");
                    played.absorb(&tx, outcome);
                    accepted.push(tx);
                    continue;
                }
                Err(failure) => failure,
            };

            store.rollback_to_savepoint(&savepoint)?;
            store.release_savepoint(&savepoint)?;

            match failure {
                TxFailure::Exec(ExecError::NetworkStopping) => {
                    self.ctx.pause(PauseReason::NetworkStopping);
                    return Err(ChainError::NetworkStopping);
                }
                TxFailure::Limit(LimitError::Stop) if generating => {
                    if index == 0 {
                        return Err(ChainError::Limit(LimitError::Stop));
                    }
                    info!(accepted = accepted.len(), "block limit reached, closing block");
                    break;
                }
                TxFailure::Limit(LimitError::Skip) if generating => {
                    debug!(tx = %tx.short_hash(), "transaction skipped");
                }
                TxFailure::Limit(err) => {
                    if !generating {
                        return Err(ChainError::Limit(err));
                    }
                    quarantine.bad.push((tx.hash, err.to_string()));
                }
                TxFailure::Exec(err) => {
                    let message = match err {
                        ExecError::TimeLimit(_) => ERR_VM_TIME_LIMIT.to_string(),
                        other => other.to_string(),
                    };
                    warn!(tx = %tx.short_hash(), error = %message, "transaction failed");
                    quarantine.bad.push((tx.hash, message.clone()));
                    if tx.is_user_contract() {
                        quarantine.bans.push(tx.key_id);
                    }
                    if !generating {
                        return Err(ChainError::Execution(message));
                    }
                }
            }
        }

        if generating && accepted.is_empty() {
            return Err(ChainError::EmptyBlock);
        }

        block.transactions = accepted;
        Ok(played)
    }

    fn persist<S: Storage>(
        &mut self,
        store: &mut S,
        block: &mut Block,
        mode: PlayMode,
        mut played: Played,
    ) -> ChainResult<BlockRecord> {
        let height = block.header.height;

        if self.ctx.params().mode == ConsensusMode::RoundRobin && !block.is_genesis() {
            let calc = BlockTimeCalculator::from_context(self.ctx);
            calc.validate_block(block.header.node_position, block.header.time, &*store)?;
        }

        if mode == PlayMode::Generate {
            block.refresh_merkle_root();
            if let Some(signer) = self.signer.as_mut() {
                block.header.signature = signer.sign(&block.hash());
            }
        }

        let rollbacks_hash = rollback_digest(&played.rollback);
        for entry in played.rollback.iter_mut() {
            entry.block_id = height;
        }
        for output in played.outputs.iter_mut() {
            output.block_id = height;
        }

        let record = BlockRecord {
            height,
            hash: block.hash(),
            data: block.encode()?,
            rollbacks_hash,
            time: block.header.time,
            node_position: block.header.node_position,
            key_id: block.header.key_id,
            ecosystem_id: block.header.ecosystem_id,
            tx_count: block.transactions.len(),
        };

        store.insert_block(record.clone())?;
        store.append_rollback(&played.rollback)?;
        for (hash, status) in &played.statuses {
            store.set_tx_status(TxStatusRecord {
                hash: *hash,
                block_id: height,
                used: true,
                status: *status,
            })?;
            store.insert_log_record(hash, height)?;
        }
        store.insert_notifications(&played.notifications)?;
        store.insert_outputs(&played.outputs)?;
        store.set_info_block(InfoBlock::from(&record))?;

        info!(
            height,
            hash = %short_hex(&record.hash),
            txs = record.tx_count,
            rollbacks = %short_hex(&rollbacks_hash),
            "block applied"
        );
        Ok(record)
    }

    fn apply_quarantine<S: Storage>(&self, store: &mut S, quarantine: Quarantine) -> ChainResult<()> {
        for (hash, message) in &quarantine.bad {
            store.mark_bad_tx(hash, message)?;
            store.dequeue_tx(hash)?;
        }
        for key_id in quarantine.bans {
            self.ctx.ban(key_id);
        }
        Ok(())
    }
}

/// The block's own outcome wins over a failure to record quarantined
/// transactions.
fn settle(
    height: i64,
    result: ChainResult<BlockRecord>,
    quarantined: ChainResult<()>,
) -> ChainResult<BlockRecord> {
    if let Err(err) = quarantined {
        error!(height, %err, "failed to quarantine transactions");
    }
    result
}
