//! Known-peers book for the tree-sharing layer.
//!
//! Peers arrive from three directions: LAN beacon datagrams, DHT agent
//! records and the seeded `known-peers.json`. Every entry passes the same
//! endpoint validation and /24 cap as DHT peers. Entries go stale after
//! 120 s without a sighting and are garbage-collected; the JSON file is
//! loaded (with validation) at start and rewritten during cleanup and on
//! stop.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::PEER_STALE_MS;
use crate::dht::peer::{validate_endpoint, SubnetCounter};
use crate::error::AgentResult;
use crate::utils::{now_ms, write_private_atomic};

pub const KNOWN_PEERS_FILE: &str = "known-peers.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KnownPeer {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub trees: HashSet<u32>,
    #[serde(default)]
    pub last_seen: u128,
}

impl KnownPeer {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct PeerBookState {
    peers: HashMap<(String, u16), KnownPeer>,
    subnets: SubnetCounter,
}

pub struct PeerBook {
    path: PathBuf,
    production: bool,
    state: Mutex<PeerBookState>,
}

impl PeerBook {
    pub fn open(data_dir: &std::path::Path, production: bool) -> AgentResult<Self> {
        crate::utils::ensure_private_dir(data_dir)?;
        let book = Self {
            path: data_dir.join(KNOWN_PEERS_FILE),
            production,
            state: Mutex::new(PeerBookState {
                peers: HashMap::new(),
                subnets: SubnetCounter::default(),
            }),
        };
        book.load();
        Ok(book)
    }

    fn load(&self) {
        let Ok(bytes) = std::fs::read(&self.path) else {
            return;
        };
        let parsed: Vec<KnownPeer> = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable known-peers file");
                return;
            }
        };
        let mut accepted = 0usize;
        for peer in parsed {
            if self.observe(&peer.host, peer.port, peer.trees.clone()) {
                accepted += 1;
            }
        }
        debug!(accepted, "known peers loaded");
    }

    /// Record a sighting of `host:port`, merging advertised chunks. Returns
    /// false when the peer fails validation or the subnet cap.
    pub fn observe(&self, host: &str, port: u16, trees: HashSet<u32>) -> bool {
        if validate_endpoint(host, port, self.production).is_err() {
            return false;
        }
        let mut state = self.state.lock().expect("peer book lock");
        let key = (host.to_string(), port);
        match state.peers.get_mut(&key) {
            Some(existing) => {
                existing.last_seen = now_ms();
                existing.trees.extend(trees);
                true
            }
            None => {
                if state.subnets.try_add(host).is_err() {
                    return false;
                }
                state.peers.insert(
                    key,
                    KnownPeer {
                        host: host.to_string(),
                        port,
                        trees,
                        last_seen: now_ms(),
                    },
                );
                true
            }
        }
    }

    pub fn all(&self) -> Vec<KnownPeer> {
        let state = self.state.lock().expect("peer book lock");
        let mut peers: Vec<KnownPeer> = state.peers.values().cloned().collect();
        peers.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        peers
    }

    /// Peers advertising `chunk_id` first, the rest after, freshest first.
    pub fn candidates_for_chunk(&self, chunk_id: u32) -> Vec<KnownPeer> {
        let mut peers = self.all();
        peers.sort_by_key(|p| !p.trees.contains(&chunk_id));
        peers
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("peer book lock").peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop peers unseen for longer than the staleness window, then persist.
    pub fn cleanup(&self) {
        let cutoff = now_ms().saturating_sub(PEER_STALE_MS);
        {
            let mut state = self.state.lock().expect("peer book lock");
            let stale: Vec<(String, u16)> = state
                .peers
                .iter()
                .filter(|(_, p)| p.last_seen < cutoff)
                .map(|(k, _)| k.clone())
                .collect();
            for key in stale {
                if let Some(peer) = state.peers.remove(&key) {
                    state.subnets.remove(&peer.host);
                }
            }
        }
        if let Err(e) = self.save() {
            warn!(error = %e, "failed to persist known peers");
        }
    }

    pub fn save(&self) -> AgentResult<()> {
        let peers = self.all();
        let bytes = serde_json::to_vec_pretty(&peers)?;
        write_private_atomic(&self.path, &bytes)
    }
}
