pub mod block;
pub mod rollback;
pub mod transaction;

pub use block::{Block, BlockHeader, BLOCK_VERSION, GENESIS_HEIGHT};
pub use rollback::{
    rollback_digest, ColumnDef, ColumnKind, RollbackEntry, RowImage, SchemaChange, TableRow,
    SCHEMA_TABLE,
};
pub use transaction::{Transaction, TxCheckError, TxKind};
