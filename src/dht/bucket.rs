//! K-buckets and the routing table.

use std::collections::VecDeque;

use crate::constants::BUCKET_SIZE;
use crate::dht::id::{cmp_distance, NodeId};
use crate::dht::peer::{validate_endpoint, DhtPeer, SubnetCounter};
use crate::utils::now_ms;

/// One bucket: at most K peers, newest at the tail. No eviction probing; a
/// full bucket ignores strangers.
#[derive(Debug, Default)]
pub struct KBucket {
    entries: VecDeque<DhtPeer>,
}

impl KBucket {
    /// Move an existing peer to the tail, or append if there is room.
    /// Returns true when the peer is (now) present.
    pub fn touch(&mut self, peer: DhtPeer) -> bool {
        if let Some(pos) = self.entries.iter().position(|p| p.id == peer.id) {
            let mut existing = self.entries.remove(pos).expect("position just found");
            existing.host = peer.host;
            existing.port = peer.port;
            existing.last_seen = now_ms();
            self.entries.push_back(existing);
            return true;
        }
        if self.entries.len() >= BUCKET_SIZE {
            return false;
        }
        self.entries.push_back(peer);
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<DhtPeer> {
        let pos = self.entries.iter().position(|p| p.id == id)?;
        self.entries.remove(pos)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DhtPeer> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All 256 buckets keyed by shared-prefix length from our own ID, plus the
/// subnet diversity counter the admission path shares.
pub struct RoutingTable {
    self_id: NodeId,
    production: bool,
    buckets: Vec<KBucket>,
    subnets: SubnetCounter,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, production: bool) -> Self {
        Self {
            self_id,
            production,
            buckets: (0..256).map(|_| KBucket::default()).collect(),
            subnets: SubnetCounter::default(),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Admission path for every observed peer: validate, ignore self, apply
    /// the subnet cap for newcomers, then LRU-touch the bucket.
    pub fn touch(&mut self, peer: DhtPeer) -> bool {
        let Ok(id) = peer.node_id() else {
            return false;
        };
        let Some(index) = self.self_id.bucket_index(id) else {
            return false; // self
        };
        if validate_endpoint(&peer.host, peer.port, self.production).is_err() {
            return false;
        }
        let known = self.buckets[index].iter().any(|p| p.id == peer.id);
        if !known && self.subnets.try_add(&peer.host).is_err() {
            return false;
        }
        let inserted = self.buckets[index].touch(peer.clone());
        if !known && !inserted {
            // Bucket full: release the subnet slot we just took.
            self.subnets.remove(&peer.host);
        }
        inserted
    }

    pub fn remove(&mut self, id: NodeId) {
        if let Some(index) = self.self_id.bucket_index(id) {
            if let Some(peer) = self.buckets[index].remove(&id.to_hex()) {
                self.subnets.remove(&peer.host);
            }
        }
    }

    /// Up to `count` known peers closest to `target` by XOR distance.
    pub fn closest(&self, target: NodeId, count: usize) -> Vec<DhtPeer> {
        let mut all: Vec<DhtPeer> = self
            .buckets
            .iter()
            .flat_map(|b| b.iter().cloned())
            .collect();
        all.sort_by(|a, b| {
            let (Ok(ia), Ok(ib)) = (a.node_id(), b.node_id()) else {
                return std::cmp::Ordering::Equal;
            };
            cmp_distance(ia, ib, target)
        });
        all.truncate(count);
        all
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(KBucket::is_empty)
    }

    pub fn all_peers(&self) -> Vec<DhtPeer> {
        self.buckets.iter().flat_map(|b| b.iter().cloned()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::BUCKET_SIZE;

    fn peer(tag: u8) -> DhtPeer {
        DhtPeer::new(NodeId::from_seed(&[tag]), "127.0.0.1", 9000 + tag as u16)
    }

    #[test]
    fn touch_moves_existing_to_tail() {
        let mut bucket = KBucket::default();
        for t in 0..3 {
            assert!(bucket.touch(peer(t)));
        }
        let first = peer(0);
        assert!(bucket.touch(first.clone()));
        let tail = bucket.iter().last().unwrap();
        assert_eq!(tail.id, first.id);
        assert_eq!(bucket.len(), 3);
    }

    #[test]
    fn full_bucket_ignores_strangers() {
        let mut bucket = KBucket::default();
        for t in 0..BUCKET_SIZE as u8 {
            assert!(bucket.touch(peer(t)));
        }
        let before: Vec<String> = bucket.iter().map(|p| p.id.clone()).collect();
        assert!(!bucket.touch(peer(200)));
        let after: Vec<String> = bucket.iter().map(|p| p.id.clone()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn routing_table_never_stores_self() {
        let me = NodeId::from_seed(b"me");
        let mut table = RoutingTable::new(me, false);
        assert!(!table.touch(DhtPeer::new(me, "127.0.0.1", 9000)));
        assert!(table.is_empty());
    }

    #[test]
    fn routing_table_rejects_invalid_endpoints() {
        let mut table = RoutingTable::new(NodeId::from_seed(b"me"), false);
        let mut bad = peer(1);
        bad.port = 80;
        assert!(!table.touch(bad));
        assert!(table.is_empty());
    }

    #[test]
    fn closest_orders_by_xor_distance() {
        let me = NodeId::from_seed(b"me");
        let mut table = RoutingTable::new(me, false);
        // Distinct public hosts so the subnet cap stays out of the way.
        for t in 0..30u8 {
            let p = DhtPeer::new(NodeId::from_seed(&[t]), &format!("9.9.{t}.1"), 9000);
            table.touch(p);
        }
        let target = NodeId::from_seed(b"target");
        let got = table.closest(target, 10);
        assert_eq!(got.len(), 10);
        for w in got.windows(2) {
            let a = w[0].node_id().unwrap().distance(target);
            let b = w[1].node_id().unwrap().distance(target);
            assert!(a <= b);
        }
    }

    #[test]
    fn subnet_cap_applies_across_buckets() {
        let me = NodeId::from_seed(b"me");
        let mut table = RoutingTable::new(me, false);
        let mut admitted = 0;
        for t in 0..10u8 {
            let p = DhtPeer::new(NodeId::from_seed(&[t]), &format!("9.9.9.{t}"), 9000);
            if table.touch(p) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, crate::constants::MAX_PEERS_PER_SUBNET);
    }
}
