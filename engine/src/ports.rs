//! Collaborators the engine consumes but does not implement: the VM,
//! signatures and the honor-node registry. Storage ports live in
//! [`crate::storage`].

use tessera_common::error::CodecError;
use tessera_common::types::{BlockHeader, RollbackEntry, Transaction};
use thiserror::Error;

use crate::context::HonorNode;
use crate::seed::TxRng;
use crate::storage::{InfoBlock, Notification, Storage, StoreError, TxOutput};

/// Block-level inputs handed to the VM with each transaction
#[derive(Debug, Clone, Copy)]
pub struct ExecContext<'a> {
    pub header: &'a BlockHeader,
    pub prev: Option<&'a InfoBlock>,
    /// True when this node is assembling the block
    pub generating: bool,
}

/// Side effects of one successfully executed transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub status: i64,
    /// Mutations in the order they were performed
    pub rollback: Vec<RollbackEntry>,
    pub notifications: Vec<Notification>,
    pub outputs: Vec<TxOutput>,
}

/// Errors surfaced by the transaction execution port
#[derive(Error, Debug)]
pub enum ExecError {
    /// The network has been halted by governance
    #[error("network is stopping")]
    NetworkStopping,

    #[error("time limit exceeded: {0}")]
    TimeLimit(String),

    #[error("{0}")]
    Failed(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl From<CodecError> for ExecError {
    fn from(err: CodecError) -> Self {
        ExecError::Storage(StoreError::Codec(err))
    }
}

/// Executes one transaction against storage.
///
/// Mutations must go through `store` so that savepoints cover them, and
/// every mutation must be reported in [`ExecOutcome::rollback`].
pub trait TxExecutor<S: Storage> {
    fn execute(
        &mut self,
        store: &mut S,
        tx: &Transaction,
        ctx: &ExecContext<'_>,
        rng: &mut TxRng,
    ) -> Result<ExecOutcome, ExecError>;
}

pub trait SignatureVerifier {
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool;
}

pub trait BlockSigner {
    fn public_key(&self) -> Vec<u8>;
    fn sign(&mut self, message: &[u8]) -> Vec<u8>;
}

/// Ordered, position-indexed list of active producers
pub trait HonorNodeRegistry {
    fn honor_nodes(&self) -> Vec<HonorNode>;

    fn node_at(&self, position: i64) -> Option<HonorNode> {
        usize::try_from(position)
            .ok()
            .and_then(|index| self.honor_nodes().get(index).cloned())
    }
}
