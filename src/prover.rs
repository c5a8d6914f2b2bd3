//! Groth16 prover boundary.
//!
//! The circuits and proving machinery live outside this crate. `CircomProver`
//! drives the external toolchain (circom witness generator + rapidsnark) the
//! same way an operator would from a shell: input.json in, proof.json +
//! public.json out, everything inside an owner-only tempdir and behind
//! `spawn_blocking` so a ~2 s proof never stalls the reactor. `MockProver` is
//! the in-memory double; it enforces the same public-signal layout the
//! circuit would.

use std::future::Future;
use std::path::PathBuf;

use ark_bn254::Fr;
use tracing::{debug, info};

use crate::chain::{Groth16Proof, ProofBundle};
use crate::error::{AgentError, AgentResult};
use crate::merkle::MerklePath;
use crate::poseidon::{self, fr_to_dec};

#[derive(Debug, Clone)]
pub struct DepositWitness {
    pub nullifier: Fr,
    pub secret: Fr,
    pub amount: u64,
}

#[derive(Debug, Clone)]
pub struct WithdrawWitness {
    pub nullifier: Fr,
    pub secret: Fr,
    pub amount: u64,
    /// Base58 recipient; embedded in the circuit as a field element.
    pub recipient: String,
    pub fee: u64,
    pub path: MerklePath,
}

/// Recipient pubkey bytes as a BN254 field element, the circuit's encoding.
pub fn recipient_field(recipient: &str) -> AgentResult<Fr> {
    let bytes = bs58::decode(recipient.trim())
        .into_vec()
        .map_err(|_| AgentError::BadInput("recipient is not base58".to_string()))?;
    if bytes.len() != 32 {
        return Err(AgentError::BadInput(
            "recipient must decode to 32 bytes".to_string(),
        ));
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(poseidon::fr_from_be_bytes(&arr))
}

pub trait Prover: Send + Sync + 'static {
    fn prove_deposit(
        &self,
        witness: &DepositWitness,
    ) -> impl Future<Output = AgentResult<ProofBundle>> + Send;

    fn prove_withdraw(
        &self,
        witness: &WithdrawWitness,
    ) -> impl Future<Output = AgentResult<ProofBundle>> + Send;
}

// ---------------------------------------------------------------------
// External circom toolchain
// ---------------------------------------------------------------------

#[derive(Clone)]
pub struct CircomProver {
    /// Directory with `<circuit>.zkey`, `<circuit>_witness` (native, optional)
    /// and `<circuit>_js/` (wasm fallback).
    pub artifact_dir: PathBuf,
    pub rapidsnark_path: PathBuf,
}

impl CircomProver {
    pub fn from_env() -> Self {
        Self {
            artifact_dir: std::env::var("CIRCUIT_ARTIFACT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/circuits")),
            rapidsnark_path: std::env::var("RAPIDSNARK_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/usr/local/bin/rapidsnark")),
        }
    }

    async fn prove(&self, circuit: &'static str, input: serde_json::Value) -> AgentResult<ProofBundle> {
        let artifact_dir = self.artifact_dir.clone();
        let rapidsnark = self.rapidsnark_path.clone();
        let bundle = tokio::task::spawn_blocking(move || -> AgentResult<ProofBundle> {
            let work = tempfile::tempdir()?;
            let input_path = work.path().join("input.json");
            let witness_path = work.path().join("witness.wtns");
            let proof_path = work.path().join("proof.json");
            let public_path = work.path().join("public.json");
            std::fs::write(&input_path, serde_json::to_vec(&input)?)?;

            // Witness: prefer the native circom C++ generator, fall back to
            // the JS/WASM one (NOTE: the native binary expects its `.dat`
            // next to it, same basename).
            let witness_bin = artifact_dir.join(format!("{circuit}_witness"));
            let out = if witness_bin.is_file() {
                std::process::Command::new(&witness_bin)
                    .args([input_path.as_path(), witness_path.as_path()])
                    .output()
            } else {
                let js = artifact_dir.join(format!("{circuit}_js/generate_witness.js"));
                let wasm = artifact_dir.join(format!("{circuit}_js/{circuit}.wasm"));
                std::process::Command::new("node")
                    .args([
                        js.as_path(),
                        wasm.as_path(),
                        input_path.as_path(),
                        witness_path.as_path(),
                    ])
                    .output()
            };
            let out = out.map_err(|e| {
                AgentError::ChainUnavailable(format!("witness generator spawn failed: {e}"))
            })?;
            if !out.status.success() {
                return Err(AgentError::Integrity(format!(
                    "witness generation failed (code={:?}): {}",
                    out.status.code(),
                    String::from_utf8_lossy(&out.stderr).trim()
                )));
            }

            let zkey = artifact_dir.join(format!("{circuit}_final.zkey"));
            let started = std::time::Instant::now();
            let out = std::process::Command::new(&rapidsnark)
                .args([
                    zkey.as_path(),
                    witness_path.as_path(),
                    proof_path.as_path(),
                    public_path.as_path(),
                ])
                .output()
                .map_err(|e| {
                    AgentError::ChainUnavailable(format!("rapidsnark spawn failed: {e}"))
                })?;
            if !out.status.success() {
                return Err(AgentError::Integrity(format!(
                    "rapidsnark failed (code={:?}): {}",
                    out.status.code(),
                    String::from_utf8_lossy(&out.stderr).trim()
                )));
            }
            info!(circuit, ms = started.elapsed().as_millis() as u64, "proof generated");

            let proof: Groth16Proof = serde_json::from_slice(&std::fs::read(&proof_path)?)?;
            let public_signals: Vec<String> =
                serde_json::from_slice(&std::fs::read(&public_path)?)?;
            Ok(ProofBundle {
                proof,
                public_signals,
            })
        })
        .await
        .map_err(|e| AgentError::Disk(format!("prover task join: {e}")))??;
        Ok(bundle)
    }
}

impl Prover for CircomProver {
    async fn prove_deposit(&self, witness: &DepositWitness) -> AgentResult<ProofBundle> {
        let commitment = poseidon::commitment(witness.nullifier, witness.secret, witness.amount);
        let input = serde_json::json!({
            "nullifier": fr_to_dec(witness.nullifier),
            "secret": fr_to_dec(witness.secret),
            "amount": witness.amount.to_string(),
            "commitment": fr_to_dec(commitment),
        });
        self.prove("deposit", input).await
    }

    async fn prove_withdraw(&self, witness: &WithdrawWitness) -> AgentResult<ProofBundle> {
        let input = serde_json::json!({
            "nullifier": fr_to_dec(witness.nullifier),
            "secret": fr_to_dec(witness.secret),
            "amount": witness.amount.to_string(),
            "fee": witness.fee.to_string(),
            "recipient": fr_to_dec(recipient_field(&witness.recipient)?),
            "root": fr_to_dec(witness.path.root),
            "pathElements": witness.path.siblings.iter().map(|s| fr_to_dec(*s)).collect::<Vec<_>>(),
            "pathIndices": witness.path.bits.clone(),
        });
        self.prove("withdraw", input).await
    }
}

// ---------------------------------------------------------------------
// In-memory double
// ---------------------------------------------------------------------

/// Test prover. Emits structurally-valid bundles whose public signals are
/// computed exactly as the circuits define them, and refuses witnesses a real
/// circuit would refuse (bad Merkle path).
#[derive(Default, Clone)]
pub struct MockProver;

fn placeholder_proof(tag: Fr) -> Groth16Proof {
    // Deterministic, obviously-synthetic coordinates derived from the witness.
    let a = fr_to_dec(poseidon::poseidon2(tag, Fr::from(1u64)));
    let b = fr_to_dec(poseidon::poseidon2(tag, Fr::from(2u64)));
    let c = fr_to_dec(poseidon::poseidon2(tag, Fr::from(3u64)));
    Groth16Proof {
        pi_a: vec![a.clone(), b.clone(), "1".to_string()],
        pi_b: vec![
            vec![a.clone(), b.clone()],
            vec![b.clone(), c.clone()],
            vec!["1".to_string(), "0".to_string()],
        ],
        pi_c: vec![c, a, "1".to_string()],
        protocol: "groth16".to_string(),
        curve: "bn128".to_string(),
    }
}

impl Prover for MockProver {
    async fn prove_deposit(&self, witness: &DepositWitness) -> AgentResult<ProofBundle> {
        let commitment = poseidon::commitment(witness.nullifier, witness.secret, witness.amount);
        debug!("mock deposit proof");
        Ok(ProofBundle {
            proof: placeholder_proof(commitment),
            public_signals: vec![fr_to_dec(commitment), witness.amount.to_string()],
        })
    }

    async fn prove_withdraw(&self, witness: &WithdrawWitness) -> AgentResult<ProofBundle> {
        let leaf = poseidon::commitment(witness.nullifier, witness.secret, witness.amount);
        if witness.path.fold(leaf) != witness.path.root {
            return Err(AgentError::Integrity(
                "witness path does not reach the claimed root".to_string(),
            ));
        }
        let nullifier_hash = poseidon::nullifier_hash(witness.nullifier);
        Ok(ProofBundle {
            proof: placeholder_proof(nullifier_hash),
            public_signals: vec![
                fr_to_dec(witness.path.root),
                fr_to_dec(nullifier_hash),
                fr_to_dec(recipient_field(&witness.recipient)?),
                witness.amount.to_string(),
                witness.fee.to_string(),
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::ChunkTree;

    #[tokio::test]
    async fn mock_withdraw_rejects_bad_path() {
        let nullifier = poseidon::fr_from_be_bytes(&[1u8; 32]);
        let secret = poseidon::fr_from_be_bytes(&[2u8; 32]);
        let leaf = poseidon::commitment(nullifier, secret, 100);
        let tree = ChunkTree::build(vec![leaf]).unwrap();
        let mut path = tree.path(0).unwrap();
        let recipient = bs58::encode([7u8; 32]).into_string();

        let good = WithdrawWitness {
            nullifier,
            secret,
            amount: 100,
            recipient: recipient.clone(),
            fee: 0,
            path: path.clone(),
        };
        let bundle = MockProver.prove_withdraw(&good).await.unwrap();
        assert_eq!(bundle.public_signals[0], fr_to_dec(tree.root()));

        path.root = Fr::from(123u64);
        let bad = WithdrawWitness { path, ..good };
        assert!(MockProver.prove_withdraw(&bad).await.is_err());
    }
}
