use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::hashing::{merkle_root, sha256, short_hex, Hash32, ZERO_HASH};
use crate::types::transaction::Transaction;

/// Height of the genesis block. It is exempt from every legality check.
pub const GENESIS_HEIGHT: i64 = 1;

/// Protocol version stamped on locally assembled blocks
pub const BLOCK_VERSION: u32 = 1;

/// Contains metadata about the block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// 1-based, monotonic block height
    pub height: i64,
    /// Unix timestamp (seconds) at which the block was produced
    pub time: i64,
    pub ecosystem_id: i64,
    /// Key of the producing node
    pub key_id: i64,
    /// Position of the producer in the honor-node list
    pub node_position: i64,
    pub version: u32,
    /// Hash of the previous block header
    pub prev_hash: Hash32,
    /// Merkle root over the transaction hashes
    pub merkle_root: Hash32,
    /// Digest of the previous block's rollback log
    pub prev_rollbacks_hash: Hash32,
    /// Producer signature over [`BlockHeader::hash`]
    pub signature: Vec<u8>,
}

impl BlockHeader {
    /// Bytes covered by the producer signature: every field but the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 * 8 + 4 + 3 * 32 + 8);
        buf.extend_from_slice(&self.height.to_be_bytes());
        buf.extend_from_slice(&self.time.to_be_bytes());
        buf.extend_from_slice(&self.ecosystem_id.to_be_bytes());
        buf.extend_from_slice(&self.key_id.to_be_bytes());
        buf.extend_from_slice(&self.node_position.to_be_bytes());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.prev_hash);
        buf.extend_from_slice(&self.merkle_root);
        buf.extend_from_slice(&self.prev_rollbacks_hash);
        buf
    }

    /// The block hash; also the message the producer signs.
    pub fn hash(&self) -> Hash32 {
        sha256(&[&self.signing_bytes()[..]])
    }

    pub fn is_genesis(&self) -> bool {
        self.height == GENESIS_HEIGHT
    }
}

/// A complete block containing a header and an ordered list of transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Assembles an unsigned block and fills in its Merkle root.
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        let mut block = Self {
            header,
            transactions,
        };
        block.refresh_merkle_root();
        block
    }

    pub fn hash(&self) -> Hash32 {
        self.header.hash()
    }

    pub fn short_hash(&self) -> String {
        short_hex(&self.hash())
    }

    pub fn is_genesis(&self) -> bool {
        self.header.is_genesis()
    }

    pub fn tx_hashes(&self) -> Vec<Hash32> {
        self.transactions.iter().map(|tx| tx.hash).collect()
    }

    pub fn compute_merkle_root(&self) -> Hash32 {
        merkle_root(&self.tx_hashes())
    }

    /// Recomputes the Merkle root after the transaction list changed.
    pub fn refresh_merkle_root(&mut self) {
        self.header.merkle_root = self.compute_merkle_root();
    }

    /// Serializes the block into its wire form
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserializes a block and checks the invariants that need no chain
    /// context: a positive height and a Merkle root matching the body.
    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        let block: Block = bincode::deserialize(raw)?;

        if block.header.height < GENESIS_HEIGHT {
            return Err(CodecError::InvalidStructure(format!(
                "block height {} is below genesis",
                block.header.height
            )));
        }

        if block.compute_merkle_root() != block.header.merkle_root {
            return Err(CodecError::InvalidStructure(format!(
                "merkle root mismatch in block {}",
                block.header.height
            )));
        }

        Ok(block)
    }
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self {
            height: GENESIS_HEIGHT,
            time: 0,
            ecosystem_id: 1,
            key_id: 0,
            node_position: 0,
            version: BLOCK_VERSION,
            prev_hash: ZERO_HASH,
            merkle_root: ZERO_HASH,
            prev_rollbacks_hash: ZERO_HASH,
            signature: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::transaction::TxKind;

    fn create_test_block(tx_count: usize) -> Block {
        let transactions = (0..tx_count)
            .map(|i| Transaction::new(1, 1, TxKind::Transfer, 100 + i as i64, 1, vec![i as u8 + 1]))
            .collect();
        Block::new(
            BlockHeader {
                height: 2,
                time: 200,
                ..Default::default()
            },
            transactions,
        )
    }

    #[test]
    fn test_block_creation_and_decoding() {
        let block = create_test_block(3);
        let raw = block.encode().unwrap();
        let decoded = Block::decode(&raw).unwrap();

        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }

    #[test]
    fn test_decode_rejects_tampered_body() {
        let mut block = create_test_block(2);
        block.transactions.pop();
        let raw = block.encode().unwrap();

        assert!(matches!(
            Block::decode(&raw),
            Err(CodecError::InvalidStructure(msg)) if msg.contains("merkle")
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Block::decode(&[1, 2, 3]),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_signature_not_part_of_hash() {
        let mut block = create_test_block(1);
        let before = block.hash();
        block.header.signature = vec![9; 64];
        assert_eq!(block.hash(), before);
    }
}
