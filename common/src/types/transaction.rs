use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hashing::{sha256, short_hex, Hash32};

/// How far ahead of the checking node's clock a transaction may be stamped
pub const MAX_TX_FORWARD_SECS: i64 = 600;

/// How far behind the checking node's clock a transaction may be stamped
pub const MAX_TX_BACK_SECS: i64 = 86_400;

/// The kind of work a transaction asks the VM to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxKind {
    /// Plain value transfer between keys
    Transfer,
    /// User-originated smart-contract call
    Contract,
    /// Node-originated system call
    System,
}

impl TxKind {
    fn tag(self) -> u8 {
        match self {
            TxKind::Transfer => 1,
            TxKind::Contract => 2,
            TxKind::System => 3,
        }
    }
}

/// A transaction as carried inside a block.
///
/// The `hash` is a content hash over every other field. It is the dedup key
/// inside a block and the global identity of the transaction once committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: Hash32,
    /// Originating key
    pub key_id: i64,
    pub ecosystem: i64,
    pub kind: TxKind,
    /// Unix timestamp (seconds) assigned by the sender
    pub time: i64,
    /// Declared execution cost
    pub fuel: u64,
    /// Opaque VM payload
    pub payload: Vec<u8>,
}

/// Reasons the transaction layer refuses a transaction before execution
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxCheckError {
    #[error("transaction hash does not match its content")]
    HashMismatch,

    #[error("transaction time {time} is too far in the future (now {now})")]
    TooEarly { time: i64, now: i64 },

    #[error("transaction time {time} is too old (now {now})")]
    TooLate { time: i64, now: i64 },

    #[error("transaction payload is empty")]
    EmptyPayload,

    #[error("transaction {0} is already committed")]
    AlreadyCommitted(String),
}

impl Transaction {
    /// Builds a transaction and stamps its content hash.
    pub fn new(
        key_id: i64,
        ecosystem: i64,
        kind: TxKind,
        time: i64,
        fuel: u64,
        payload: Vec<u8>,
    ) -> Self {
        let mut tx = Self {
            hash: [0u8; 32],
            key_id,
            ecosystem,
            kind,
            time,
            fuel,
            payload,
        };
        tx.hash = tx.compute_hash();
        tx
    }

    /// Hash over every field except `hash` itself
    pub fn compute_hash(&self) -> Hash32 {
        sha256(&[
            &self.key_id.to_be_bytes()[..],
            &self.ecosystem.to_be_bytes()[..],
            &[self.kind.tag()][..],
            &self.time.to_be_bytes()[..],
            &self.fuel.to_be_bytes()[..],
            &self.payload[..],
        ])
    }

    /// Encoded size in bytes, as counted against block size ceilings.
    pub fn size(&self) -> u64 {
        // Serializing plain fields cannot fail; an impossible failure is
        // reported as an oversized transaction.
        bincode::serialized_size(self).unwrap_or(u64::MAX)
    }

    /// True for smart-contract calls submitted by users. Failures of these
    /// escalate to a ban of the originating key.
    pub fn is_user_contract(&self) -> bool {
        self.kind == TxKind::Contract
    }

    pub fn short_hash(&self) -> String {
        short_hex(&self.hash)
    }

    /// Structural and time checks that do not need storage access.
    pub fn check(&self, now: i64) -> Result<(), TxCheckError> {
        if self.compute_hash() != self.hash {
            return Err(TxCheckError::HashMismatch);
        }

        if self.payload.is_empty() {
            return Err(TxCheckError::EmptyPayload);
        }

        if self.time > now + MAX_TX_FORWARD_SECS {
            return Err(TxCheckError::TooEarly {
                time: self.time,
                now,
            });
        }

        if self.time < now - MAX_TX_BACK_SECS {
            return Err(TxCheckError::TooLate {
                time: self.time,
                now,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const NOW: i64 = 1_700_000_000;

    fn create_test_transaction(time: i64) -> Transaction {
        Transaction::new(7, 1, TxKind::Transfer, time, 10, b"{}".to_vec())
    }

    #[test]
    fn test_hash_covers_content() {
        let tx = create_test_transaction(NOW);
        assert_eq!(tx.hash, tx.compute_hash());

        let mut tampered = tx.clone();
        tampered.fuel += 1;
        assert_eq!(tampered.check(NOW), Err(TxCheckError::HashMismatch));
    }

    #[test_case(NOW, true ; "current time")]
    #[test_case(NOW + MAX_TX_FORWARD_SECS, true ; "forward edge")]
    #[test_case(NOW + MAX_TX_FORWARD_SECS + 1, false ; "too early")]
    #[test_case(NOW - MAX_TX_BACK_SECS, true ; "back edge")]
    #[test_case(NOW - MAX_TX_BACK_SECS - 1, false ; "too late")]
    fn test_time_window(time: i64, ok: bool) {
        assert_eq!(create_test_transaction(time).check(NOW).is_ok(), ok);
    }

    #[test]
    fn test_empty_payload_rejected() {
        let tx = Transaction::new(7, 1, TxKind::Contract, NOW, 0, Vec::new());
        assert_eq!(tx.check(NOW), Err(TxCheckError::EmptyPayload));
    }

    #[test]
    fn test_size_grows_with_payload() {
        let small = Transaction::new(1, 1, TxKind::Transfer, NOW, 0, vec![1; 10]);
        let large = Transaction::new(1, 1, TxKind::Transfer, NOW, 0, vec![1; 110]);
        assert_eq!(large.size() - small.size(), 100);
    }
}
