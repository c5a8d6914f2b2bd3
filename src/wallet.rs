//! Agent wallet lifecycle.
//!
//! A dedicated keypair at `<data-dir>/agent-wallet.json` (64-byte secret as
//! a JSON byte array, the standard Solana keypair file format), created on
//! first start with owner-only permissions. An explicit override path must
//! already exist, decode to exactly 64 bytes, and gets a permission check.

use std::path::Path;

use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use tracing::{info, warn};

use crate::error::{AgentError, AgentResult};
use crate::utils::write_private_atomic;

pub const WALLET_FILE: &str = "agent-wallet.json";

fn read_keypair(path: &Path) -> AgentResult<Keypair> {
    let bytes = std::fs::read(path)?;
    let raw: Vec<u8> = serde_json::from_slice(&bytes)
        .map_err(|e| AgentError::Integrity(format!("wallet file is not a byte array: {e}")))?;
    if raw.len() != 64 {
        return Err(AgentError::Integrity(format!(
            "wallet secret must be 64 bytes, got {}",
            raw.len()
        )));
    }
    Keypair::from_bytes(&raw)
        .map_err(|e| AgentError::Integrity(format!("wallet secret rejected: {e}")))
}

fn write_keypair(path: &Path, keypair: &Keypair) -> AgentResult<()> {
    let raw: Vec<u8> = keypair.to_bytes().to_vec();
    write_private_atomic(path, &serde_json::to_vec(&raw)?)
}

#[cfg(unix)]
fn check_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        let mode = meta.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(
                path = %path.display(),
                mode = %format!("{:o}", mode & 0o777),
                "wallet file is readable by group/other"
            );
        }
    }
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) {}

/// Load the default wallet, creating it on first start.
pub fn load_or_create(data_dir: &Path) -> AgentResult<Keypair> {
    crate::utils::ensure_private_dir(data_dir)?;
    let path = data_dir.join(WALLET_FILE);
    if path.exists() {
        let keypair = read_keypair(&path)?;
        check_permissions(&path);
        return Ok(keypair);
    }
    let keypair = Keypair::new();
    write_keypair(&path, &keypair)?;
    info!(pubkey = %keypair.pubkey(), "agent wallet created");
    Ok(keypair)
}

/// Load a caller-specified wallet. Never creates the file.
pub fn load_override(path: &Path) -> AgentResult<Keypair> {
    if !path.is_file() {
        return Err(AgentError::NotFound(format!(
            "wallet override {} does not exist",
            path.display()
        )));
    }
    check_permissions(path);
    read_keypair(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_start_creates_and_reloads_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let a = load_or_create(dir.path()).unwrap();
        let b = load_or_create(dir.path()).unwrap();
        assert_eq!(a.pubkey(), b.pubkey());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join(WALLET_FILE))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn override_must_exist_and_be_64_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            load_override(&missing),
            Err(AgentError::NotFound(_))
        ));

        let short = dir.path().join("short.json");
        std::fs::write(&short, serde_json::to_vec(&vec![1u8; 32]).unwrap()).unwrap();
        assert!(matches!(
            load_override(&short),
            Err(AgentError::Integrity(_))
        ));

        let good = dir.path().join("good.json");
        let keypair = Keypair::new();
        std::fs::write(&good, serde_json::to_vec(&keypair.to_bytes().to_vec()).unwrap()).unwrap();
        assert_eq!(load_override(&good).unwrap().pubkey(), keypair.pubkey());
    }
}
