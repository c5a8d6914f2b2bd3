//! Deposit-code envelope.
//!
//! A deposit code is the bearer capability for one shielded deposit. Version
//! 1 layout, 77 bytes, base58-wrapped for transport:
//!
//! `version:u8 = 1 | nullifier:32 | secret:32 | chunk_id:u32 BE | amount:u64 BE`
//!
//! Possession implies the right to spend; callers must not log or transmit
//! codes unless the debug-secrets flag is set.

use crate::error::{AgentError, AgentResult};

pub const DEPOSIT_CODE_VERSION: u8 = 1;
const V1_LEN: usize = 1 + 32 + 32 + 4 + 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositCode {
    pub nullifier: [u8; 32],
    pub secret: [u8; 32],
    pub chunk_id: u32,
    pub amount: u64,
}

impl DepositCode {
    pub fn encode(&self) -> String {
        let mut buf = Vec::with_capacity(V1_LEN);
        buf.push(DEPOSIT_CODE_VERSION);
        buf.extend_from_slice(&self.nullifier);
        buf.extend_from_slice(&self.secret);
        buf.extend_from_slice(&self.chunk_id.to_be_bytes());
        buf.extend_from_slice(&self.amount.to_be_bytes());
        bs58::encode(buf).into_string()
    }

    pub fn decode(code: &str) -> AgentResult<Self> {
        let bytes = bs58::decode(code.trim())
            .into_vec()
            .map_err(|e| AgentError::BadInput(format!("deposit code is not base58: {e}")))?;
        let version = *bytes
            .first()
            .ok_or_else(|| AgentError::Integrity("empty deposit code".to_string()))?;
        if version != DEPOSIT_CODE_VERSION {
            return Err(AgentError::Integrity(format!(
                "unsupported deposit code version {version}"
            )));
        }
        if bytes.len() != V1_LEN {
            return Err(AgentError::Integrity(format!(
                "deposit code v1 must be {V1_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut nullifier = [0u8; 32];
        nullifier.copy_from_slice(&bytes[1..33]);
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&bytes[33..65]);
        let chunk_id = u32::from_be_bytes(bytes[65..69].try_into().expect("4 bytes"));
        let amount = u64::from_be_bytes(bytes[69..77].try_into().expect("8 bytes"));
        Ok(Self {
            nullifier,
            secret,
            chunk_id,
            amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let code = DepositCode {
            nullifier: [0xAB; 32],
            secret: [0x01; 32],
            chunk_id: 42,
            amount: 1_000_000,
        };
        let s = code.encode();
        // 77 bytes land in 105-106 base58 chars.
        assert!(s.len() >= 100 && s.len() <= 110, "unexpected length {}", s.len());
        assert_eq!(DepositCode::decode(&s).unwrap(), code);
    }

    #[test]
    fn round_trip_extremes() {
        for (chunk_id, amount) in [(0u32, 0u64), (u32::MAX, u64::MAX)] {
            let code = DepositCode {
                nullifier: [0u8; 32],
                secret: [0xFF; 32],
                chunk_id,
                amount,
            };
            assert_eq!(DepositCode::decode(&code.encode()).unwrap(), code);
        }
    }

    #[test]
    fn rejects_unknown_version() {
        let mut raw = vec![2u8];
        raw.extend_from_slice(&[0u8; 76]);
        let s = bs58::encode(raw).into_string();
        let err = DepositCode::decode(&s).unwrap_err();
        assert!(matches!(err, AgentError::Integrity(_)), "{err}");
    }

    #[test]
    fn rejects_wrong_length() {
        let mut raw = vec![1u8];
        raw.extend_from_slice(&[0u8; 40]);
        let s = bs58::encode(raw).into_string();
        assert!(matches!(
            DepositCode::decode(&s),
            Err(AgentError::Integrity(_))
        ));
    }

    #[test]
    fn rejects_bad_encoding() {
        assert!(matches!(
            DepositCode::decode("not base58 0OIl"),
            Err(AgentError::BadInput(_))
        ));
    }
}
