//! Ed25519 adapters for the signing and verification ports.

use commonware_cryptography::{Ed25519, PublicKey, Scheme, Signature};
use tessera_common::config::HonorNodeConfig;
use tessera_common::error::CodecError;

use crate::context::HonorNode;
use crate::ports::{BlockSigner, SignatureVerifier};

/// Namespace mixed into every block signature to avoid cross-protocol replay
pub const BLOCK_NAMESPACE: &[u8] = b"TESSERA_BLOCK";

/// Signs block hashes with a node's Ed25519 key
pub struct Ed25519Signer {
    signer: Ed25519,
}

impl Ed25519Signer {
    /// Deterministic key for local networks and tests
    pub fn from_seed(seed: u64) -> Self {
        Self {
            signer: Ed25519::from_seed(seed),
        }
    }
}

impl BlockSigner for Ed25519Signer {
    fn public_key(&self) -> Vec<u8> {
        self.signer.public_key().to_vec()
    }

    fn sign(&mut self, message: &[u8]) -> Vec<u8> {
        self.signer.sign(Some(BLOCK_NAMESPACE), message).to_vec()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        Ed25519::verify(
            Some(BLOCK_NAMESPACE),
            message,
            &PublicKey::from(public_key.to_vec()),
            &Signature::from(signature.to_vec()),
        )
    }
}

/// Builds the honor-node registry from configuration. Nodes configured with
/// a seed get the matching derived key.
pub fn honor_nodes_from_config(nodes: &[HonorNodeConfig]) -> Result<Vec<HonorNode>, CodecError> {
    nodes
        .iter()
        .map(|node| {
            let public_key = match (&node.public_key, node.key_seed) {
                (Some(hex_key), _) => hex::decode(hex_key)?,
                (None, Some(seed)) => Ed25519::from_seed(seed).public_key().to_vec(),
                (None, None) => {
                    return Err(CodecError::Malformed(format!(
                        "honor node {} has neither a public key nor a seed",
                        node.key_id
                    )))
                }
            };
            Ok(HonorNode {
                key_id: node.key_id,
                public_key,
                address: node.address.clone(),
                stopped: node.stopped,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let mut signer = Ed25519Signer::from_seed(7);
        let signature = signer.sign(b"block hash");

        let verifier = Ed25519Verifier;
        assert!(verifier.verify(&signer.public_key(), b"block hash", &signature));
        assert!(!verifier.verify(&signer.public_key(), b"other hash", &signature));
        assert!(!verifier.verify(
            &Ed25519Signer::from_seed(8).public_key(),
            b"block hash",
            &signature
        ));
    }

    #[test]
    fn test_signature_bound_to_block_namespace() {
        let mut raw = Ed25519::from_seed(7);
        let unscoped = raw.sign(None, b"block hash");
        let scoped = raw.sign(Some(BLOCK_NAMESPACE), b"block hash");

        let public_key = Ed25519Signer::from_seed(7).public_key();
        assert!(!Ed25519Verifier.verify(&public_key, b"block hash", &unscoped));
        assert!(Ed25519Verifier.verify(&public_key, b"block hash", &scoped));
    }

    #[test]
    fn test_honor_nodes_from_seed_and_hex() {
        let seeded = Ed25519Signer::from_seed(3).public_key();
        let nodes = honor_nodes_from_config(&[
            HonorNodeConfig {
                key_id: 1,
                key_seed: Some(3),
                public_key: None,
                address: "127.0.0.1:7001".to_string(),
                stopped: false,
            },
            HonorNodeConfig {
                key_id: 2,
                key_seed: None,
                public_key: Some(hex::encode(&seeded)),
                address: String::new(),
                stopped: true,
            },
        ])
        .unwrap();

        assert_eq!(nodes[0].public_key, seeded);
        assert_eq!(nodes[1].public_key, seeded);
        assert!(nodes[1].stopped);
    }

    #[test]
    fn test_honor_node_without_key_rejected() {
        let result = honor_nodes_from_config(&[HonorNodeConfig {
            key_id: 9,
            key_seed: None,
            public_key: None,
            address: String::new(),
            stopped: false,
        }]);
        assert!(matches!(result, Err(CodecError::Malformed(_))));
    }
}
