//! Persistent deposit book.
//!
//! A single JSON array at `<data-dir>/deposits.json` (owner-only), rewritten
//! atomically via temp-file + rename on every mutation. One async mutex
//! serializes all operations in-process, so `add`, `find_unwithdrawn` and the
//! withdraw-flag flips never interleave their read-modify-write cycles.
//! Records are never deleted.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{AgentError, AgentResult};
use crate::utils::{rfc3339_now, write_private_atomic};

pub const DEPOSITS_FILE: &str = "deposits.json";

/// Sentinel `withdraw_ref` installed by the pre-mark step, replaced with the
/// relayer queue id once the submission is acknowledged.
pub const WITHDRAW_REF_PENDING: &str = "pending-submit";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DepositRecord {
    pub code: String,
    pub commitment: String,
    pub amount: u64,
    pub tx_id: String,
    pub timestamp: String,
    pub withdrawn: bool,
    #[serde(default)]
    pub withdraw_ref: Option<String>,
    #[serde(default)]
    pub withdrawn_at: Option<String>,
}

pub struct DepositBook {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DepositBook {
    pub fn open(data_dir: &std::path::Path) -> AgentResult<Self> {
        crate::utils::ensure_private_dir(data_dir)?;
        let path = data_dir.join(DEPOSITS_FILE);
        if !path.exists() {
            write_private_atomic(&path, b"[]")?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    fn read_all(&self) -> AgentResult<Vec<DepositRecord>> {
        let bytes = std::fs::read(&self.path)?;
        let records: Vec<DepositRecord> = serde_json::from_slice(&bytes)
            .map_err(|e| AgentError::Integrity(format!("deposit book corrupt: {e}")))?;
        Ok(records)
    }

    fn write_all(&self, records: &[DepositRecord]) -> AgentResult<()> {
        let bytes = serde_json::to_vec_pretty(records)?;
        write_private_atomic(&self.path, &bytes)
    }

    /// Append a fresh record for a chain-accepted deposit.
    pub async fn add(
        &self,
        code: &str,
        commitment: &str,
        amount: u64,
        tx_id: &str,
    ) -> AgentResult<()> {
        let _g = self.lock.lock().await;
        let mut records = self.read_all()?;
        records.push(DepositRecord {
            code: code.to_string(),
            commitment: commitment.to_string(),
            amount,
            tx_id: tx_id.to_string(),
            timestamp: rfc3339_now(),
            withdrawn: false,
            withdraw_ref: None,
            withdrawn_at: None,
        });
        self.write_all(&records)?;
        debug!(count = records.len(), "deposit book updated");
        Ok(())
    }

    /// Oldest record with `withdrawn == false`, optionally filtered by amount.
    pub async fn find_unwithdrawn(&self, amount: Option<u64>) -> AgentResult<Option<DepositRecord>> {
        let _g = self.lock.lock().await;
        let records = self.read_all()?;
        Ok(records
            .into_iter()
            .find(|r| !r.withdrawn && amount.map(|a| r.amount == a).unwrap_or(true)))
    }

    /// Pre-mark: flip the flag before any network submission. Fails with
    /// `Conflict` if the record is already flagged (double-spend attempt).
    pub async fn mark_withdrawn(&self, code: &str, reference: &str) -> AgentResult<()> {
        let _g = self.lock.lock().await;
        let mut records = self.read_all()?;
        let rec = records
            .iter_mut()
            .find(|r| r.code == code)
            .ok_or_else(|| AgentError::NotFound("no deposit with that code".to_string()))?;
        if rec.withdrawn {
            return Err(AgentError::Conflict(
                "deposit already flagged withdrawn".to_string(),
            ));
        }
        rec.withdrawn = true;
        rec.withdraw_ref = Some(reference.to_string());
        rec.withdrawn_at = Some(rfc3339_now());
        self.write_all(&records)
    }

    /// Rollback branch: clear the flag after a failed relayer submission.
    pub async fn clear_withdrawn(&self, code: &str) -> AgentResult<()> {
        let _g = self.lock.lock().await;
        let mut records = self.read_all()?;
        let rec = records
            .iter_mut()
            .find(|r| r.code == code)
            .ok_or_else(|| AgentError::NotFound("no deposit with that code".to_string()))?;
        rec.withdrawn = false;
        rec.withdraw_ref = None;
        rec.withdrawn_at = None;
        self.write_all(&records)
    }

    /// Replace the pre-mark sentinel with the relayer's queue id.
    pub async fn update_withdraw_ref(&self, code: &str, reference: &str) -> AgentResult<()> {
        let _g = self.lock.lock().await;
        let mut records = self.read_all()?;
        let rec = records
            .iter_mut()
            .find(|r| r.code == code)
            .ok_or_else(|| AgentError::NotFound("no deposit with that code".to_string()))?;
        rec.withdraw_ref = Some(reference.to_string());
        self.write_all(&records)
    }

    pub async fn all(&self) -> AgentResult<Vec<DepositRecord>> {
        let _g = self.lock.lock().await;
        self.read_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh_book() -> (tempfile::TempDir, DepositBook) {
        let dir = tempfile::tempdir().unwrap();
        let book = DepositBook::open(dir.path()).unwrap();
        (dir, book)
    }

    #[tokio::test]
    async fn add_and_find_oldest_first() {
        let (_dir, book) = fresh_book().await;
        book.add("code-a", "1", 100, "tx-a").await.unwrap();
        book.add("code-b", "2", 100, "tx-b").await.unwrap();
        let found = book.find_unwithdrawn(Some(100)).await.unwrap().unwrap();
        assert_eq!(found.code, "code-a");
        assert!(book.find_unwithdrawn(Some(999)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn premark_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let book = DepositBook::open(dir.path()).unwrap();
            book.add("code-a", "1", 100, "tx-a").await.unwrap();
            book.mark_withdrawn("code-a", WITHDRAW_REF_PENDING)
                .await
                .unwrap();
            // Simulated crash: the relayer POST never happens, the process dies.
        }
        let book = DepositBook::open(dir.path()).unwrap();
        assert!(book.find_unwithdrawn(Some(100)).await.unwrap().is_none());
        let rec = &book.all().await.unwrap()[0];
        assert!(rec.withdrawn);
        assert_eq!(rec.withdraw_ref.as_deref(), Some(WITHDRAW_REF_PENDING));
    }

    #[tokio::test]
    async fn rollback_restores_pending_state() {
        let (_dir, book) = fresh_book().await;
        book.add("code-a", "1", 100, "tx-a").await.unwrap();
        book.mark_withdrawn("code-a", WITHDRAW_REF_PENDING)
            .await
            .unwrap();
        book.clear_withdrawn("code-a").await.unwrap();
        let found = book.find_unwithdrawn(Some(100)).await.unwrap().unwrap();
        assert_eq!(found.code, "code-a");
        assert!(found.withdraw_ref.is_none());
    }

    #[tokio::test]
    async fn double_mark_is_conflict() {
        let (_dir, book) = fresh_book().await;
        book.add("code-a", "1", 100, "tx-a").await.unwrap();
        book.mark_withdrawn("code-a", "r1").await.unwrap();
        assert!(matches!(
            book.mark_withdrawn("code-a", "r2").await,
            Err(AgentError::Conflict(_))
        ));
    }
}
