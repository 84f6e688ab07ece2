use tessera_common::error::CodecError;
use thiserror::Error;

use crate::consensus::ConsensusError;
use crate::limits::LimitError;
use crate::ports::ExecError;
use crate::storage::StoreError;

/// Why a block could not be validated, played, persisted or rolled back
#[derive(Error, Debug)]
pub enum ChainError {
    /// Malformed or non-contiguous block
    #[error("structural error: {0}")]
    Structural(String),

    /// Block time in the future or before the first block
    #[error("temporal error: {0}")]
    Temporal(String),

    #[error("duplicate block in slot: {0}")]
    DuplicateSlot(String),

    #[error("block {height} is not in the slot of node {node_position}")]
    WrongProducer { height: i64, node_position: i64 },

    #[error("invalid signature on block {height}")]
    Signature { height: i64 },

    #[error("limit error: {0}")]
    Limit(#[from] LimitError),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("network is stopping")]
    NetworkStopping,

    #[error("rollback consistency error: {0}")]
    RollbackConsistency(String),

    #[error("{failed} transactions of block {height} failed their checks")]
    TransactionCheckFailed { height: i64, failed: usize },

    #[error("key {key_id} sent more than {limit} transactions in one block")]
    UserLimit { key_id: i64, limit: u64 },

    #[error("generated block has no transactions")]
    EmptyBlock,

    #[error("block {height} is not the chain head (head is {head})")]
    NotHead { height: i64, head: i64 },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl ChainError {
    /// Duplicate-slot rejections are expected when producers race and are
    /// logged at warning level.
    pub fn is_duplicate_slot(&self) -> bool {
        matches!(self, ChainError::DuplicateSlot(_))
    }
}

impl From<ConsensusError> for ChainError {
    fn from(error: ConsensusError) -> Self {
        match error {
            ConsensusError::BeforeAnchor { .. } => ChainError::Temporal(error.to_string()),
            ConsensusError::DuplicateBlock { .. } => ChainError::DuplicateSlot(error.to_string()),
            ConsensusError::Storage(err) => ChainError::Storage(err),
        }
    }
}

impl From<ExecError> for ChainError {
    fn from(error: ExecError) -> Self {
        match error {
            ExecError::NetworkStopping => ChainError::NetworkStopping,
            other => ChainError::Execution(other.to_string()),
        }
    }
}

pub type ChainResult<T> = Result<T, ChainError>;
