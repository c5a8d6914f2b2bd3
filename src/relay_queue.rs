//! Relayer delay queue and its processor.
//!
//! Accepted withdraw requests sit in RAM with a CSPRNG-drawn execution time;
//! one long-lived processor task pops ready entries and submits them to the
//! chain strictly one at a time, so two withdraws always land in queue-pop
//! order. A failed submission re-arms the entry 60 s out and retries until
//! it succeeds or the agent shuts down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::OsRng;
use rand::Rng;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::chain::{ChainClient, ProofBundle};
use crate::constants::{CHAIN_CALL_TIMEOUT_MS, RELAYER_RETRY_MS};
use crate::error::AgentResult;
use crate::utils::{now_ms, random_id128};

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: String,
    pub bundle: ProofBundle,
    pub recipient: String,
    pub amount: u64,
    pub chunk_id: u32,
    pub submitted_at: u128,
    pub execute_at: u128,
}

pub struct RelayQueue {
    min_delay_ms: u64,
    max_delay_ms: u64,
    entries: Mutex<Vec<QueueEntry>>,
    wake: Notify,
    processing: AtomicBool,
}

/// Uniform delay in `[min, max]` from the OS CSPRNG. A predictable delay
/// would let an observer pair submissions with executions.
pub fn draw_delay_ms(min_ms: u64, max_ms: u64) -> u64 {
    if min_ms >= max_ms {
        return min_ms;
    }
    OsRng.gen_range(min_ms..=max_ms)
}

impl RelayQueue {
    pub fn new(min_delay_ms: u64, max_delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            min_delay_ms,
            max_delay_ms,
            entries: Mutex::new(Vec::new()),
            wake: Notify::new(),
            processing: AtomicBool::new(false),
        })
    }

    /// Enqueue an accepted submission. Returns `(queue_id, execute_at_ms)`.
    pub fn push(
        &self,
        bundle: ProofBundle,
        recipient: String,
        amount: u64,
        chunk_id: u32,
    ) -> (String, u128) {
        let id = random_id128();
        let submitted_at = now_ms();
        let execute_at =
            submitted_at + draw_delay_ms(self.min_delay_ms, self.max_delay_ms) as u128;
        self.entries.lock().expect("queue lock").push(QueueEntry {
            id: id.clone(),
            bundle,
            recipient,
            amount,
            chunk_id,
            submitted_at,
            execute_at,
        });
        self.wake.notify_one();
        (id, execute_at)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Relaxed)
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    /// Earliest execute_at among queued entries.
    fn next_due(&self) -> Option<u128> {
        self.entries
            .lock()
            .expect("queue lock")
            .iter()
            .map(|e| e.execute_at)
            .min()
    }

    fn pop_ready(&self) -> Vec<QueueEntry> {
        let now = now_ms();
        let mut entries = self.entries.lock().expect("queue lock");
        let mut ready = Vec::new();
        let mut i = 0;
        while i < entries.len() {
            if entries[i].execute_at <= now {
                ready.push(entries.remove(i));
            } else {
                i += 1;
            }
        }
        // Oldest submission first.
        ready.sort_by_key(|e| e.submitted_at);
        ready
    }

    fn requeue(&self, mut entry: QueueEntry) {
        entry.execute_at = now_ms() + RELAYER_RETRY_MS;
        self.entries.lock().expect("queue lock").push(entry);
    }

    async fn submit_one<C: ChainClient>(&self, chain: &C, entry: &QueueEntry) -> AgentResult<String> {
        let nullifier_hash = entry.bundle.nullifier_hash()?;
        chain
            .submit_withdraw(
                &entry.bundle,
                &entry.recipient,
                entry.chunk_id,
                nullifier_hash,
                Duration::from_millis(CHAIN_CALL_TIMEOUT_MS),
            )
            .await
    }

    /// Processor loop. Spawn once; parks on the notify handle while the
    /// queue is empty and sleeps until the earliest `execute_at` otherwise.
    pub async fn run<C: ChainClient>(self: Arc<Self>, chain: Arc<C>) {
        loop {
            let ready = self.pop_ready();
            if ready.is_empty() {
                match self.next_due() {
                    None => self.wake.notified().await,
                    Some(due) => {
                        let wait_ms = due.saturating_sub(now_ms()).min(u64::MAX as u128) as u64;
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
                            _ = self.wake.notified() => {}
                        }
                    }
                }
                continue;
            }
            self.processing.store(true, Ordering::Relaxed);
            for entry in ready {
                match self.submit_one(chain.as_ref(), &entry).await {
                    Ok(tx_id) => {
                        info!(queue_id = %entry.id, %tx_id, "relayed withdraw submitted");
                    }
                    Err(e) => {
                        // Flat backoff, indefinite retry: the source behaves
                        // this way and a dropped withdraw is worse than a
                        // late one. ChainRejected entries retry too.
                        warn!(queue_id = %entry.id, error = %e, "withdraw submission failed, re-queued");
                        crate::metrics::metrics().relay_retries_total.inc();
                        self.requeue(entry);
                    }
                }
            }
            crate::metrics::metrics().queue_length.set(self.len() as i64);
            self.processing.store(false, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Groth16Proof, MockChain};
    use crate::poseidon::{fr_to_dec, nullifier_hash};
    use ark_bn254::Fr;

    fn bundle(nullifier: u64) -> ProofBundle {
        let nh = nullifier_hash(Fr::from(nullifier));
        ProofBundle {
            proof: Groth16Proof {
                pi_a: vec!["1".into(), "2".into(), "1".into()],
                pi_b: vec![vec!["1".into(), "2".into()], vec!["3".into(), "4".into()]],
                pi_c: vec!["5".into(), "6".into(), "1".into()],
                protocol: "groth16".into(),
                curve: "bn128".into(),
            },
            public_signals: vec!["0".into(), fr_to_dec(nh), "0".into(), "100".into(), "0".into()],
        }
    }

    #[test]
    fn delays_stay_inside_the_window() {
        for _ in 0..2_000 {
            let d = draw_delay_ms(50, 150);
            assert!((50..=150).contains(&d));
        }
    }

    #[test]
    fn delay_distribution_is_uniform_chi_square() {
        // 10 equal bins over [0, 10_000); chi-square with 9 degrees of
        // freedom, critical value 21.67 at the 1% level.
        const DRAWS: usize = 10_000;
        const BINS: usize = 10;
        let mut counts = [0usize; BINS];
        for _ in 0..DRAWS {
            let d = draw_delay_ms(0, 9_999);
            counts[(d as usize * BINS) / 10_000] += 1;
        }
        let expected = (DRAWS / BINS) as f64;
        let chi2: f64 = counts
            .iter()
            .map(|c| {
                let diff = *c as f64 - expected;
                diff * diff / expected
            })
            .sum();
        assert!(chi2 < 21.67, "chi-square {chi2} exceeds the 1% critical value");
    }

    #[tokio::test]
    async fn processor_submits_in_pop_order_and_retries_failures() {
        let queue = RelayQueue::new(0, 0);
        let chain = Arc::new(MockChain::new());
        chain.set_fail_submits(true);

        let (id1, _) = queue.push(bundle(1), bs58::encode([1u8; 32]).into_string(), 100, 0);
        assert_eq!(queue.len(), 1);

        let runner = tokio::spawn(Arc::clone(&queue).run(Arc::clone(&chain)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Submission failed; the entry is re-armed, not dropped.
        assert_eq!(queue.len(), 1);
        assert!(!chain.nullifier_published(&fr_to_dec(nullifier_hash(Fr::from(1u64)))));

        runner.abort();
        let _ = id1;
    }

    #[tokio::test]
    async fn processor_drains_ready_entries() {
        let queue = RelayQueue::new(0, 0);
        let chain = Arc::new(MockChain::new());
        queue.push(bundle(7), bs58::encode([1u8; 32]).into_string(), 100, 0);
        queue.push(bundle(8), bs58::encode([2u8; 32]).into_string(), 100, 0);

        let runner = tokio::spawn(Arc::clone(&queue).run(Arc::clone(&chain)));
        for _ in 0..50 {
            if queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(queue.is_empty());
        assert!(chain.nullifier_published(&fr_to_dec(nullifier_hash(Fr::from(7u64)))));
        assert!(chain.nullifier_published(&fr_to_dec(nullifier_hash(Fr::from(8u64)))));
        runner.abort();
    }
}
