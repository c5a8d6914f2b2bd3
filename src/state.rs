use std::sync::{Arc, Mutex};

use crate::merkle::MerkleEngine;
use crate::peers::PeerBook;
use crate::rate_limit::RateLimiter;
use crate::relay_queue::RelayQueue;

/// Shared state behind the HTTP surface.
pub struct AppState {
    pub engine: Arc<MerkleEngine>,
    pub peers: Arc<PeerBook>,
    pub queue: Arc<RelayQueue>,
    pub rate_limiter: Mutex<RateLimiter>,
    pub http_port: u16,
    /// Relayer fee, base units. Fixed at zero in this deployment.
    pub fee: u64,
}
