//! Process-wide Poseidon over BN254.
//!
//! One hasher per arity (2 for tree nodes and nullifier hashes, 3 for
//! commitments), created once and shared behind a lock so the mixing loop and
//! the tree engine can hash concurrently. `warm_up()` runs at agent start so
//! the first user-facing operation carries no constant-setup timing
//! fingerprint.

use std::sync::{Mutex, OnceLock};

use ark_bn254::Fr;
use ark_ff::{BigInteger, PrimeField};
use light_poseidon::{Poseidon, PoseidonHasher};
use num_bigint::BigUint;

use crate::error::{AgentError, AgentResult};

static POSEIDON2: OnceLock<Mutex<Poseidon<Fr>>> = OnceLock::new();
static POSEIDON3: OnceLock<Mutex<Poseidon<Fr>>> = OnceLock::new();
static FR_MODULUS: OnceLock<BigUint> = OnceLock::new();

fn hasher2() -> &'static Mutex<Poseidon<Fr>> {
    POSEIDON2.get_or_init(|| {
        Mutex::new(Poseidon::<Fr>::new_circom(2).expect("poseidon arity-2 setup"))
    })
}

fn hasher3() -> &'static Mutex<Poseidon<Fr>> {
    POSEIDON3.get_or_init(|| {
        Mutex::new(Poseidon::<Fr>::new_circom(3).expect("poseidon arity-3 setup"))
    })
}

fn fr_modulus() -> &'static BigUint {
    FR_MODULUS.get_or_init(|| BigUint::from_bytes_be(&Fr::MODULUS.to_bytes_be()))
}

/// Eagerly build both hashers (and hash once to touch the round constants).
pub fn warm_up() {
    let _ = poseidon2(Fr::from(0u64), Fr::from(0u64));
    let _ = poseidon3(Fr::from(0u64), Fr::from(0u64), Fr::from(0u64));
}

pub fn poseidon2(a: Fr, b: Fr) -> Fr {
    let mut h = hasher2().lock().expect("poseidon2 lock");
    h.hash(&[a, b]).expect("poseidon2 hash")
}

pub fn poseidon3(a: Fr, b: Fr, c: Fr) -> Fr {
    let mut h = hasher3().lock().expect("poseidon3 lock");
    h.hash(&[a, b, c]).expect("poseidon3 hash")
}

/// Leaf commitment. Argument order (nullifier, secret, amount) is fixed by
/// the deposit circuit; do not reorder.
pub fn commitment(nullifier: Fr, secret: Fr, amount: u64) -> Fr {
    poseidon3(nullifier, secret, Fr::from(amount))
}

/// Nullifier hash published on-chain at withdraw time.
pub fn nullifier_hash(nullifier: Fr) -> Fr {
    poseidon2(nullifier, Fr::from(0u64))
}

// ---------------------------------------------------------------------
// Field element representation helpers
// ---------------------------------------------------------------------

/// 32 big-endian bytes -> field element, reduced mod p. Used for freshly
/// drawn secrets where reduction is the intended behavior.
pub fn fr_from_be_bytes(bytes: &[u8; 32]) -> Fr {
    Fr::from_be_bytes_mod_order(bytes)
}

/// Field element -> fixed 32 big-endian bytes.
pub fn fr_to_be_bytes(v: Fr) -> [u8; 32] {
    let bytes = v.into_bigint().to_bytes_be();
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// Field element -> canonical decimal string (wire/JSON representation).
pub fn fr_to_dec(v: Fr) -> String {
    BigUint::from_bytes_be(&fr_to_be_bytes(v)).to_str_radix(10)
}

/// Decimal string -> field element. Rejects non-decimal input and values
/// outside the field instead of silently reducing.
pub fn fr_from_dec(s: &str) -> AgentResult<Fr> {
    let n = s
        .trim()
        .parse::<BigUint>()
        .map_err(|_| AgentError::Integrity(format!("not a decimal field element: {s:?}")))?;
    if &n >= fr_modulus() {
        return Err(AgentError::Integrity(
            "field element out of range".to_string(),
        ));
    }
    let bytes = n.to_bytes_be();
    Ok(Fr::from_be_bytes_mod_order(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commitment_is_deterministic() {
        let n = fr_from_be_bytes(&[7u8; 32]);
        let s = fr_from_be_bytes(&[9u8; 32]);
        assert_eq!(commitment(n, s, 1_000_000), commitment(n, s, 1_000_000));
        assert_eq!(commitment(n, s, 1_000_000), poseidon3(n, s, Fr::from(1_000_000u64)));
    }

    #[test]
    fn commitment_argument_order_matters() {
        let n = fr_from_be_bytes(&[7u8; 32]);
        let s = fr_from_be_bytes(&[9u8; 32]);
        assert_ne!(commitment(n, s, 5), commitment(s, n, 5));
    }

    #[test]
    fn poseidon2_order_matters() {
        let a = Fr::from(1u64);
        let b = Fr::from(2u64);
        assert_ne!(poseidon2(a, b), poseidon2(b, a));
    }

    #[test]
    fn nullifier_hash_pads_with_zero() {
        let n = fr_from_be_bytes(&[3u8; 32]);
        assert_eq!(nullifier_hash(n), poseidon2(n, Fr::from(0u64)));
    }

    #[test]
    fn decimal_round_trip() {
        let v = poseidon2(Fr::from(11u64), Fr::from(22u64));
        let dec = fr_to_dec(v);
        assert_eq!(fr_from_dec(&dec).unwrap(), v);
    }

    #[test]
    fn decimal_rejects_out_of_range() {
        // p itself is not a valid canonical element.
        let p = BigUint::from_bytes_be(&Fr::MODULUS.to_bytes_be());
        assert!(fr_from_dec(&p.to_str_radix(10)).is_err());
        assert!(fr_from_dec("not-a-number").is_err());
    }
}
