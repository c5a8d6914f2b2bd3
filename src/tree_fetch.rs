//! Peer tree retrieval.
//!
//! `GET /tree/{chunk}` against known peers, advertisers of the chunk first.
//! A structurally-valid response is parsed back into a replica; the caller
//! decides whether to root-check it against the chain before installing.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{AgentError, AgentResult};
use crate::merkle::TreeSnapshot;
use crate::peers::PeerBook;

const PEER_FETCH_TIMEOUT_MS: u64 = 10_000;

pub struct TreeFetcher {
    http: reqwest::Client,
    peers: Arc<PeerBook>,
}

impl TreeFetcher {
    pub fn new(peers: Arc<PeerBook>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_millis(PEER_FETCH_TIMEOUT_MS))
                .build()
                .expect("reqwest client"),
            peers,
        }
    }

    /// First peer that produces a parseable full tree for the chunk wins.
    pub async fn fetch_complete_tree(&self, chunk_id: u32) -> AgentResult<TreeSnapshot> {
        let candidates = self.peers.candidates_for_chunk(chunk_id);
        if candidates.is_empty() {
            return Err(AgentError::NotFound("no peers to fetch from".to_string()));
        }
        for peer in candidates {
            let url = format!("{}/tree/{chunk_id}", peer.base_url());
            match self.fetch_one(&url).await {
                Ok(snapshot) if snapshot.chunk_id == chunk_id => {
                    debug!(chunk_id, peer = %peer.addr(), "tree fetched from peer");
                    return Ok(snapshot);
                }
                Ok(snapshot) => {
                    warn!(
                        chunk_id,
                        got = snapshot.chunk_id,
                        peer = %peer.addr(),
                        "peer returned the wrong chunk"
                    );
                }
                Err(e) => {
                    debug!(chunk_id, peer = %peer.addr(), error = %e, "peer tree fetch failed");
                }
            }
        }
        Err(AgentError::NotFound(format!(
            "no peer could serve chunk {chunk_id}"
        )))
    }

    async fn fetch_one(&self, url: &str) -> AgentResult<TreeSnapshot> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| AgentError::Network(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AgentError::NotFound(format!(
                "peer answered {}",
                resp.status()
            )));
        }
        resp.json::<TreeSnapshot>()
            .await
            .map_err(|e| AgentError::Integrity(format!("bad tree payload: {e}")))
    }
}
