//! Two-node DHT scenarios over loopback: bootstrap, rendezvous announce,
//! agent discovery and lookup convergence.

use std::sync::Arc;

use cipher_agent::dht::id::{key_target, NodeId};
use cipher_agent::dht::DhtNode;

async fn started_node(tag: &[u8]) -> Arc<DhtNode> {
    let node = DhtNode::new(NodeId::from_seed(tag), false);
    node.start(0).await.expect("dht start");
    node
}

fn record_ids(records: &[serde_json::Value]) -> Vec<String> {
    records
        .iter()
        .filter_map(|r| r.get("node_id").and_then(|v| v.as_str()))
        .map(str::to_string)
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn isolated_node_finds_only_itself() {
    let node = started_node(b"isolated").await;
    // Before any announce there is nothing under the network key.
    assert!(node.find_agents().await.is_empty());

    node.announce(8547, None).await;
    let agents = node.find_agents().await;
    let ids = record_ids(&agents);
    assert_eq!(ids, vec![node.id().to_hex()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn two_nodes_discover_each_other() {
    let a = started_node(b"node-a").await;
    let b = started_node(b"node-b").await;

    b.bootstrap("127.0.0.1", a.port()).await.expect("bootstrap");
    // The PONG inserted A into B's table; A learned B from the inbound PING.
    assert!(b.peer_count() >= 1);
    assert!(a.peer_count() >= 1);

    a.announce(1111, None).await;
    b.announce(2222, None).await;

    let from_a = record_ids(&a.find_agents().await);
    let from_b = record_ids(&b.find_agents().await);
    assert!(from_a.contains(&a.id().to_hex()) && from_a.contains(&b.id().to_hex()));
    assert!(from_b.contains(&a.id().to_hex()) && from_b.contains(&b.id().to_hex()));
}

#[tokio::test(flavor = "multi_thread")]
async fn lookup_never_regresses_from_the_initial_shortlist() {
    let seed = started_node(b"seed").await;
    let mut others = Vec::new();
    for i in 0..4u8 {
        let node = started_node(&[b'x', i]).await;
        node.bootstrap("127.0.0.1", seed.port()).await.expect("bootstrap");
        others.push(node);
    }
    // Let the seed's table absorb everyone, then have a latecomer look up a
    // fresh target through it.
    let late = started_node(b"latecomer").await;
    late.bootstrap("127.0.0.1", seed.port()).await.expect("bootstrap");

    let target = key_target("some-target-key");
    let initial_best = late
        .known_peers()
        .iter()
        .filter_map(|p| p.node_id().ok())
        .map(|id| id.distance(target))
        .min();
    let results = late.lookup(target).await;
    assert!(!results.is_empty());
    let result_best = results
        .iter()
        .filter_map(|p| p.node_id().ok())
        .map(|id| id.distance(target))
        .min()
        .expect("lookup returned peers");
    if let Some(initial) = initial_best {
        assert!(result_best <= initial, "lookup regressed from the seed view");
    }
    // Results are sorted nearest-first.
    let dists: Vec<_> = results
        .iter()
        .filter_map(|p| p.node_id().ok())
        .map(|id| id.distance(target))
        .collect();
    let mut sorted = dists.clone();
    sorted.sort();
    assert_eq!(dists, sorted);
}

#[tokio::test(flavor = "multi_thread")]
async fn bootstrap_against_dead_seed_times_out() {
    let node = DhtNode::new(NodeId::from_seed(b"alone"), false);
    node.start(0).await.unwrap();
    // Nothing listens on this port; the RPC must fail, not hang.
    let err = node.bootstrap("127.0.0.1", 1025).await.unwrap_err();
    let msg = err.to_string();
    assert!(
        msg.contains("connect") || msg.contains("Timeout") || msg.contains("rpc"),
        "{msg}"
    );
}
