//! 256-bit node identifiers and the XOR metric.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{AgentError, AgentResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    /// Deterministic ID from a caller-provided seed.
    pub fn from_seed(seed: &[u8]) -> Self {
        NodeId(Sha256::digest(seed).into())
    }

    /// Fresh random ID (hash of 32 CSPRNG bytes).
    pub fn random() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> AgentResult<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|_| AgentError::BadInput("node id is not hex".to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AgentError::BadInput("node id must be 32 bytes".to_string()))?;
        Ok(NodeId(arr))
    }

    /// XOR distance to another ID, big-endian.
    pub fn distance(self, other: NodeId) -> [u8; 32] {
        let mut d = [0u8; 32];
        for (i, out) in d.iter_mut().enumerate() {
            *out = self.0[i] ^ other.0[i];
        }
        d
    }

    /// `255 - floor(log2(distance))`, i.e. shared-prefix length. `None` for
    /// the zero distance (self); self is never bucketed.
    pub fn bucket_index(self, other: NodeId) -> Option<usize> {
        let d = self.distance(other);
        for (byte_i, byte) in d.iter().enumerate() {
            if *byte != 0 {
                let bit = byte.leading_zeros() as usize; // 0..=7
                return Some(byte_i * 8 + bit);
            }
        }
        None
    }
}

/// The DHT key space: lookup targets are SHA-256 of a UTF-8 key.
pub fn key_target(key: &str) -> NodeId {
    NodeId::from_seed(key.as_bytes())
}

/// Compare two IDs by XOR distance to a target. Used to keep shortlists and
/// bucket queries ordered.
pub fn cmp_distance(a: NodeId, b: NodeId, target: NodeId) -> std::cmp::Ordering {
    a.distance(target).cmp(&b.distance(target))
}
