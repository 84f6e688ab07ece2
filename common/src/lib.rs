// Wire types, hashing and configuration shared by the engine and the node
pub mod config;
pub mod error;
pub mod hashing;
pub mod types;

// Re-export commonly used types
pub use config::{ConsensusMode, NodeConfig};
pub use error::{CodecError, ConfigError};
pub use hashing::{Hash32, ZERO_HASH};
pub use types::{Block, BlockHeader, RollbackEntry, SchemaChange, Transaction, TxKind};
