use sha2::{Digest, Sha256};

/// A SHA-256 digest. Block hashes, transaction hashes, Merkle roots and
/// rollback-log digests all share this representation.
pub type Hash32 = [u8; 32];

pub const ZERO_HASH: Hash32 = [0u8; 32];

/// Hashes the concatenation of `parts`.
pub fn sha256(parts: &[&[u8]]) -> Hash32 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = ZERO_HASH;
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Computes a binary Merkle root over transaction hashes.
///
/// An odd node at any level is paired with itself. An empty list yields
/// [`ZERO_HASH`] and a single leaf is its own root.
pub fn merkle_root(leaves: &[Hash32]) -> Hash32 {
    if leaves.is_empty() {
        return ZERO_HASH;
    }

    let mut level: Vec<Hash32> = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                sha256(&[&left[..], &right[..]])
            })
            .collect();
    }
    level[0]
}

/// Short hex prefix used in log lines.
pub fn short_hex(hash: &Hash32) -> String {
    hex::encode(&hash[..8])
}
