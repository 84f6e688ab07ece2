//! Block lifecycle engine: validation, playback, round-robin scheduling,
//! per-block limits and rollback.

pub mod chain;
pub mod consensus;
pub mod context;
pub mod crypto;
pub mod error;
pub mod executor;
pub mod limits;
pub mod playback;
pub mod ports;
pub mod rollback;
pub mod seed;
pub mod storage;
pub mod validation;

pub use chain::Chain;
pub use consensus::BlockTimeCalculator;
pub use context::{Clock, ManualClock, NodeContext, SystemClock, SystemParameters};
pub use crypto::{honor_nodes_from_config, Ed25519Signer, Ed25519Verifier};
pub use error::{ChainError, ChainResult};
pub use executor::{Instruction, LedgerExecutor};
pub use playback::{BlockPlayer, PlayMode};
pub use rollback::{rollback_block, rollback_to_height};
pub use storage::{MemoryStore, Storage};
pub use validation::BlockValidator;
