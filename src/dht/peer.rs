//! Peer records and admission checks.
//!
//! Crude diversity heuristics only: host syntax, port range, private-range
//! rejection in production, and a per-/24 cap. Real Sybil resistance is out
//! of scope.

use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::constants::MAX_PEERS_PER_SUBNET;
use crate::dht::id::NodeId;
use crate::error::{AgentError, AgentResult};
use crate::utils::now_ms;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DhtPeer {
    pub id: NodeIdHex,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub last_seen: u128,
}

/// Hex-encoded node id as it travels in JSON messages.
pub type NodeIdHex = String;

impl DhtPeer {
    pub fn new(id: NodeId, host: &str, port: u16) -> Self {
        Self {
            id: id.to_hex(),
            host: host.to_string(),
            port,
            last_seen: now_ms(),
        }
    }

    pub fn node_id(&self) -> AgentResult<NodeId> {
        NodeId::from_hex(&self.id)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn private_nets() -> [Ipv4Net; 3] {
    [
        "10.0.0.0/8".parse().expect("static net"),
        "172.16.0.0/12".parse().expect("static net"),
        "192.168.0.0/16".parse().expect("static net"),
    ]
}

fn looks_like_domain(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host
            .split('.')
            .all(|label| {
                !label.is_empty()
                    && label.len() <= 63
                    && label
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-')
            })
}

/// Host + port admission check.
///
/// In production mode non-loopback private IPv4 ranges are rejected; outside
/// production (LAN and test deployments) they are allowed.
pub fn validate_endpoint(host: &str, port: u16, production: bool) -> AgentResult<()> {
    if !(1024..=65535).contains(&port) {
        return Err(AgentError::BadInput(format!(
            "peer port {port} outside 1024..65535"
        )));
    }
    let host = host.trim();
    if host.is_empty() {
        return Err(AgentError::BadInput("peer host is empty".to_string()));
    }
    if let Ok(ip) = Ipv4Addr::from_str(host) {
        if production && !ip.is_loopback() && private_nets().iter().any(|n| n.contains(&ip)) {
            return Err(AgentError::BadInput(format!(
                "peer host {ip} is in a private range"
            )));
        }
        return Ok(());
    }
    if !looks_like_domain(host) {
        return Err(AgentError::BadInput(format!("peer host {host:?} is invalid")));
    }
    Ok(())
}

/// /24 network of an IPv4 host, if the host is an address at all. Domain
/// names fall outside the subnet cap.
pub fn subnet_of(host: &str) -> Option<[u8; 3]> {
    Ipv4Addr::from_str(host.trim())
        .ok()
        .map(|ip| [ip.octets()[0], ip.octets()[1], ip.octets()[2]])
}

/// Tracks how many peers each /24 already contributed.
#[derive(Debug, Default)]
pub struct SubnetCounter {
    counts: std::collections::HashMap<[u8; 3], usize>,
}

impl SubnetCounter {
    pub fn try_add(&mut self, host: &str) -> AgentResult<()> {
        if let Some(net) = subnet_of(host) {
            let count = self.counts.entry(net).or_insert(0);
            if *count >= MAX_PEERS_PER_SUBNET {
                return Err(AgentError::Capacity(format!(
                    "subnet {}.{}.{}.0/24 already has {MAX_PEERS_PER_SUBNET} peers",
                    net[0], net[1], net[2]
                )));
            }
            *count += 1;
        }
        Ok(())
    }

    pub fn remove(&mut self, host: &str) {
        if let Some(net) = subnet_of(host) {
            if let Some(count) = self.counts.get_mut(&net) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.counts.remove(&net);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_ports() {
        assert!(validate_endpoint("1.2.3.4", 80, false).is_err());
        assert!(validate_endpoint("1.2.3.4", 1023, false).is_err());
        assert!(validate_endpoint("1.2.3.4", 1024, false).is_ok());
        assert!(validate_endpoint("1.2.3.4", 65535, false).is_ok());
    }

    #[test]
    fn rejects_private_ranges_in_production() {
        for host in ["10.1.2.3", "172.16.0.9", "172.31.255.1", "192.168.1.1"] {
            assert!(validate_endpoint(host, 8549, true).is_err(), "{host}");
            assert!(validate_endpoint(host, 8549, false).is_ok(), "{host}");
        }
        // Loopback and public stay valid everywhere.
        assert!(validate_endpoint("127.0.0.1", 8549, true).is_ok());
        assert!(validate_endpoint("8.8.8.8", 8549, true).is_ok());
        // 172.32/ is outside the 172.16/12 block.
        assert!(validate_endpoint("172.32.0.1", 8549, true).is_ok());
    }

    #[test]
    fn validates_domains() {
        assert!(validate_endpoint("relay.example.com", 8549, true).is_ok());
        assert!(validate_endpoint("bad host", 8549, true).is_err());
        assert!(validate_endpoint("", 8549, true).is_err());
    }

    #[test]
    fn subnet_cap_rejects_sixth_peer() {
        let mut counter = SubnetCounter::default();
        for i in 1..=5 {
            counter.try_add(&format!("9.9.9.{i}")).unwrap();
        }
        assert!(matches!(
            counter.try_add("9.9.9.6"),
            Err(AgentError::Capacity(_))
        ));
        // Different /24 still fine; removal frees a slot.
        counter.try_add("9.9.8.1").unwrap();
        counter.remove("9.9.9.1");
        counter.try_add("9.9.9.6").unwrap();
    }
}
