use std::path::Path;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{AgentError, AgentResult};

pub fn now_ms() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

pub fn rfc3339_now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Fresh 128-bit identifier, hex-encoded (queue IDs).
pub fn random_id128() -> String {
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    hex::encode(b)
}

/// Fresh 64-bit identifier, hex-encoded (DHT transaction tokens).
pub fn random_id64() -> String {
    let mut b = [0u8; 8];
    OsRng.fill_bytes(&mut b);
    hex::encode(b)
}

/// Create `dir` with owner-only permissions.
pub fn ensure_private_dir(dir: &Path) -> AgentResult<()> {
    if !dir.is_dir() {
        std::fs::create_dir_all(dir)?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Atomic owner-only write: temp file in the same directory, fsync, rename.
/// Readers observe either the previous or the new content, never a torn file.
pub fn write_private_atomic(path: &Path, bytes: &[u8]) -> AgentResult<()> {
    use std::io::Write;
    let dir = path
        .parent()
        .ok_or_else(|| AgentError::Disk(format!("{} has no parent dir", path.display())))?;
    ensure_private_dir(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    tmp.persist(path)
        .map_err(|e| AgentError::Disk(format!("persist {}: {}", path.display(), e.error)))?;
    Ok(())
}

/// Canonicalize a JSON value for comparison: objects get sorted keys at every
/// depth. Used to deduplicate DHT records that differ only in key order.
pub fn canonical_json(v: &serde_json::Value) -> String {
    fn sort(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Object(m) => {
                let sorted: std::collections::BTreeMap<_, _> =
                    m.iter().map(|(k, val)| (k.clone(), sort(val))).collect();
                serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
            }
            serde_json::Value::Array(a) => serde_json::Value::Array(a.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(v).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_json_ignores_key_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":3}}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn atomic_write_sets_owner_only_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.json");
        write_private_atomic(&path, b"[]").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"[]");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
