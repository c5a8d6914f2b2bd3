//! LAN presence beacon.
//!
//! Every 30 s the agent broadcasts a small JSON datagram announcing its HTTP
//! port and the chunks it can serve; every datagram heard from somebody else
//! records the sender in the peer book. Discovery only — trees themselves
//! travel over HTTP (§ tree_fetch).

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::constants::BEACON_INTERVAL_SECS;
use crate::merkle::MerkleEngine;
use crate::peers::PeerBook;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BeaconMessage {
    #[serde(rename = "type")]
    kind: String,
    port: u16,
    trees: Vec<u32>,
    timestamp: u64,
}

pub struct LanBeacon {
    socket: UdpSocket,
    beacon_port: u16,
    http_port: u16,
    engine: Arc<MerkleEngine>,
    peers: Arc<PeerBook>,
}

impl LanBeacon {
    pub async fn bind(
        beacon_port: u16,
        http_port: u16,
        engine: Arc<MerkleEngine>,
        peers: Arc<PeerBook>,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", beacon_port)).await?;
        socket.set_broadcast(true)?;
        let beacon_port = socket.local_addr()?.port();
        Ok(Self {
            socket,
            beacon_port,
            http_port,
            engine,
            peers,
        })
    }

    pub fn port(&self) -> u16 {
        self.beacon_port
    }

    /// Broadcast targets: the limited broadcast address plus the /24
    /// directed broadcast of whatever address routes externally.
    fn broadcast_targets(&self) -> Vec<Ipv4Addr> {
        let mut targets = vec![Ipv4Addr::BROADCAST];
        if let Some(local) = local_ipv4() {
            if !local.is_loopback() {
                let o = local.octets();
                targets.push(Ipv4Addr::new(o[0], o[1], o[2], 255));
            }
        }
        targets
    }

    async fn announce_once(&self) {
        let msg = BeaconMessage {
            kind: "announce".to_string(),
            port: self.http_port,
            trees: self.engine.chunks(),
            timestamp: crate::utils::now_ms() as u64,
        };
        let Ok(payload) = serde_json::to_vec(&msg) else {
            return;
        };
        for target in self.broadcast_targets() {
            if let Err(e) = self.socket.send_to(&payload, (target, self.beacon_port)).await {
                trace!(%target, error = %e, "beacon send failed");
            }
        }
    }

    fn handle_datagram(&self, payload: &[u8], sender: std::net::SocketAddr) {
        let Ok(msg) = serde_json::from_slice::<BeaconMessage>(payload) else {
            return; // not ours; LAN broadcast ports see all sorts of traffic
        };
        if msg.kind != "announce" {
            return;
        }
        // Our own datagrams come back on the broadcast address.
        if msg.port == self.http_port && is_local_addr(sender.ip()) {
            return;
        }
        let host = sender.ip().to_string();
        let trees: HashSet<u32> = msg.trees.into_iter().collect();
        if self.peers.observe(&host, msg.port, trees) {
            debug!(%host, port = msg.port, "peer discovered via lan beacon");
        }
    }

    /// Drives both halves forever: the 30 s announce timer and the receive
    /// loop. Run as one background task.
    pub async fn run(self) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(BEACON_INTERVAL_SECS));
        let mut buf = [0u8; 2048];
        loop {
            tokio::select! {
                _ = ticker.tick() => self.announce_once().await,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, sender)) => self.handle_datagram(&buf[..len], sender),
                    Err(e) => {
                        warn!(error = %e, "beacon receive failed");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

/// The IPv4 address the host would use for external traffic. A connected UDP
/// socket never sends anything; the OS just picks a route.
fn local_ipv4() -> Option<Ipv4Addr> {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    probe.connect("8.8.8.8:53").ok()?;
    match probe.local_addr().ok()? {
        std::net::SocketAddr::V4(addr) => Some(*addr.ip()),
        _ => None,
    }
}

fn is_local_addr(ip: std::net::IpAddr) -> bool {
    match ip {
        std::net::IpAddr::V4(v4) => {
            v4.is_loopback() || Some(v4) == local_ipv4()
        }
        std::net::IpAddr::V6(v6) => v6.is_loopback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::MerkleEngine;

    #[tokio::test]
    async fn records_foreign_announce_datagrams() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(MerkleEngine::new(dir.path()));
        let peers = Arc::new(PeerBook::open(dir.path(), false).unwrap());
        let beacon = LanBeacon::bind(0, 8547, engine, Arc::clone(&peers))
            .await
            .unwrap();

        let msg = serde_json::json!({
            "type": "announce",
            "port": 9123,
            "trees": [0, 1],
            "timestamp": 1u64,
        });
        // Foreign sender: loopback IS local, so a same-port message would be
        // dropped as our own; a different port must be recorded.
        beacon.handle_datagram(
            &serde_json::to_vec(&msg).unwrap(),
            "127.0.0.1:5555".parse().unwrap(),
        );
        assert_eq!(peers.len(), 1);
        let peer = &peers.all()[0];
        assert_eq!(peer.port, 9123);
        assert!(peer.trees.contains(&1));
    }

    #[tokio::test]
    async fn ignores_own_datagrams_and_noise() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(MerkleEngine::new(dir.path()));
        let peers = Arc::new(PeerBook::open(dir.path(), false).unwrap());
        let beacon = LanBeacon::bind(0, 8547, engine, Arc::clone(&peers))
            .await
            .unwrap();

        let own = serde_json::json!({"type": "announce", "port": 8547, "trees": [], "timestamp": 1u64});
        beacon.handle_datagram(
            &serde_json::to_vec(&own).unwrap(),
            "127.0.0.1:5555".parse().unwrap(),
        );
        beacon.handle_datagram(b"garbage", "127.0.0.1:5555".parse().unwrap());
        assert!(peers.is_empty());
    }
}
