//! End-to-end agent scenarios over the in-memory chain and prover doubles:
//! deposit/withdraw round trip, crash-resume, rollback on relayer failure,
//! peer tree sync, and the relayer HTTP surface limits.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use cipher_agent::agent::AgentNode;
use cipher_agent::chain::{ChainClient, MockChain};
use cipher_agent::codec::DepositCode;
use cipher_agent::config::Config;
use cipher_agent::poseidon;
use cipher_agent::prover::MockProver;

const DENOMINATION: u64 = 1_000_000;

fn test_agent(
    dir: &std::path::Path,
    chain: Arc<MockChain>,
) -> Arc<AgentNode<MockChain, MockProver>> {
    AgentNode::new(
        Config::for_tests(dir.to_path_buf()),
        chain,
        Arc::new(MockProver),
    )
    .expect("agent")
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition never became true");
}

#[tokio::test(flavor = "multi_thread")]
async fn deposit_withdraw_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(MockChain::new());
    let agent = test_agent(dir.path(), Arc::clone(&chain));
    agent.start().await.unwrap();

    // Deposit: the returned commitment is Poseidon3(nullifier, secret, amount).
    let outcome = agent.deposit().await.unwrap();
    let code = DepositCode::decode(&outcome.deposit_code).unwrap();
    let expected = poseidon::commitment(
        poseidon::fr_from_be_bytes(&code.nullifier),
        poseidon::fr_from_be_bytes(&code.secret),
        DENOMINATION,
    );
    assert_eq!(outcome.commitment, poseidon::fr_to_dec(expected));
    assert_eq!(chain.seeded_leaf_count(0), 1);

    // After a refresh the replica root matches the chain's.
    agent.load_tree(0).await.unwrap();
    let chain_root = chain.fetch_root(0, Duration::from_secs(1)).await.unwrap();
    assert_eq!(agent.engine.root(0), Some(chain_root));
    let path = agent.engine.path(0, 0).unwrap();
    assert_eq!(path.root, chain_root);

    // Withdraw to a fresh key. No peers -> self-service queue.
    let recipient = bs58::encode([42u8; 32]).into_string();
    let outcome = agent.withdraw(DENOMINATION, &recipient).await.unwrap();
    assert!(outcome.relayer.is_none());

    let nh = poseidon::fr_to_dec(poseidon::nullifier_hash(poseidon::fr_from_be_bytes(
        &code.nullifier,
    )));
    wait_until(|| chain.nullifier_published(&nh)).await;

    let records = agent.book.all().await.unwrap();
    assert!(records[0].withdrawn);
    assert_eq!(records[0].withdraw_ref.as_deref(), Some(outcome.reference.as_str()));
}

#[tokio::test(flavor = "multi_thread")]
async fn withdraw_resumes_after_crash_before_mark() {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(MockChain::new());
    {
        // First life: deposit lands on-chain and in the book, then the
        // process "dies" (instance dropped, nothing marked).
        let agent = test_agent(dir.path(), Arc::clone(&chain));
        agent.deposit().await.unwrap();
    }
    // Another deposit from elsewhere grows the tree past ours.
    let other = poseidon::commitment(
        poseidon::fr_from_be_bytes(&[9u8; 32]),
        poseidon::fr_from_be_bytes(&[8u8; 32]),
        DENOMINATION,
    );
    let existing = chain.fetch_leaves(0, Duration::from_secs(1)).await.unwrap();
    let mut leaves = existing.clone();
    leaves.push(other);
    chain.seed_leaves(0, leaves);

    // Second life: same data dir, fresh process. The pending record must
    // still be withdrawable against the larger tree.
    let agent = test_agent(dir.path(), Arc::clone(&chain));
    agent.start().await.unwrap();
    let recipient = bs58::encode([7u8; 32]).into_string();
    agent.withdraw(DENOMINATION, &recipient).await.unwrap();

    let records = agent.book.all().await.unwrap();
    assert!(records[0].withdrawn);
}

#[tokio::test(flavor = "multi_thread")]
async fn relayer_failure_rolls_the_premark_back() {
    use axum::routing::{get, post};

    // A relayer that reports an empty queue but refuses every submission.
    let broken = axum::Router::new()
        .route(
            "/relayer/status",
            get(|| async {
                axum::Json(serde_json::json!({
                    "queueLength": 0, "processing": false, "fee": 0, "maxDelay": 1000
                }))
            }),
        )
        .route(
            "/relayer/submit",
            post(|| async {
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    axum::Json(serde_json::json!({"error": "nope"})),
                )
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let broken_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move { axum::serve(listener, broken).await.unwrap() });

    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(MockChain::new());
    let agent = test_agent(dir.path(), Arc::clone(&chain));
    agent.start().await.unwrap();
    let outcome = agent.deposit().await.unwrap();
    agent.peers.observe("127.0.0.1", broken_port, HashSet::new());

    let recipient = bs58::encode([5u8; 32]).into_string();
    let err = agent.withdraw(DENOMINATION, &recipient).await.unwrap_err();
    assert!(err.to_string().contains("500"), "{err}");

    // Rollback restored the record; no nullifier reached the chain.
    let record = agent
        .book
        .find_unwithdrawn(Some(DENOMINATION))
        .await
        .unwrap()
        .expect("deposit is spendable again");
    assert!(record.withdraw_ref.is_none());
    let code = DepositCode::decode(&outcome.deposit_code).unwrap();
    let nh = poseidon::fr_to_dec(poseidon::nullifier_hash(poseidon::fr_from_be_bytes(
        &code.nullifier,
    )));
    assert!(!chain.nullifier_published(&nh));
}

#[tokio::test(flavor = "multi_thread")]
async fn tree_syncs_from_a_peer_when_chain_leaves_are_unreadable() {
    // Node A: full replica served over HTTP.
    let dir_a = tempfile::tempdir().unwrap();
    let chain = Arc::new(MockChain::new());
    let leaves: Vec<_> = (1..=9u64)
        .map(|i| poseidon::commitment(i.into(), (i + 100).into(), DENOMINATION))
        .collect();
    chain.seed_leaves(1, leaves);
    let agent_a = test_agent(dir_a.path(), Arc::clone(&chain));
    let port_a = agent_a.start().await.unwrap();
    agent_a.load_tree(1).await.unwrap();
    let root_a = agent_a.engine.root(1).unwrap();

    // Node B: no cache, leaf reads dead -> only the peer path can work.
    let dir_b = tempfile::tempdir().unwrap();
    let agent_b = test_agent(dir_b.path(), Arc::clone(&chain));
    agent_b.start().await.unwrap();
    chain.set_fail_leaf_reads(true);
    agent_b.peers.observe("127.0.0.1", port_a, HashSet::from([1]));

    agent_b.load_tree(1).await.unwrap();
    assert_eq!(agent_b.engine.root(1), Some(root_a));
    chain.set_fail_leaf_reads(false);
}

#[tokio::test(flavor = "multi_thread")]
async fn relayer_surface_enforces_limits() {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(MockChain::new());
    let agent = test_agent(dir.path(), Arc::clone(&chain));
    let port = agent.start().await.unwrap();
    let http = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{port}");

    let valid = serde_json::json!({
        "proof": {
            "pi_a": ["1", "2", "1"],
            "pi_b": [["1", "2"], ["3", "4"], ["1", "0"]],
            "pi_c": ["5", "6", "1"],
            "protocol": "groth16",
            "curve": "bn128",
            "publicSignals": ["0", "77", "0", "100", "0"],
        },
        "recipient": bs58::encode([1u8; 32]).into_string(),
        "amount": 100u64,
        "chunkId": 0u32,
    });

    // Structural failures are 400s.
    for (field, value) in [
        ("amount", serde_json::json!(0)),
        ("amount", serde_json::json!(10_000_000_000_000u64)),
        ("chunkId", serde_json::json!(5000)),
        ("recipient", serde_json::json!("tooshort")),
    ] {
        let mut bad = valid.clone();
        bad[field] = value;
        let resp = http
            .post(format!("{base}/relayer/submit"))
            .json(&bad)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "{field}");
    }

    // Oversized body is 413.
    let huge = vec![b'x'; 1024 * 1024 + 10];
    let resp = http
        .post(format!("{base}/relayer/submit"))
        .header("content-type", "application/json")
        .body(huge)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 413);

    // First 10 requests in the window pass (modulo the ones above that
    // already consumed slots), the next gets 429.
    let mut saw_ok = false;
    let mut saw_429 = false;
    for _ in 0..12 {
        let resp = http
            .post(format!("{base}/relayer/submit"))
            .json(&valid)
            .send()
            .await
            .unwrap();
        match resp.status().as_u16() {
            200 => {
                saw_ok = true;
                let body: serde_json::Value = resp.json().await.unwrap();
                assert_eq!(body["success"], true);
                assert!(body["queueId"].is_string());
            }
            429 => saw_429 = true,
            other => panic!("unexpected status {other}"),
        }
    }
    assert!(saw_ok && saw_429);

    // Status endpoint reflects the queue.
    let status: serde_json::Value = http
        .get(format!("{base}/relayer/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(status["queueLength"].is_number());
    assert_eq!(status["fee"], 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn tree_endpoint_serves_and_404s() {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(MockChain::new());
    let leaves = vec![poseidon::commitment(1u64.into(), 2u64.into(), DENOMINATION)];
    chain.seed_leaves(3, leaves);
    let agent = test_agent(dir.path(), Arc::clone(&chain));
    let port = agent.start().await.unwrap();
    agent.load_tree(3).await.unwrap();

    let base = format!("http://127.0.0.1:{port}");
    let tree: serde_json::Value = reqwest::get(format!("{base}/tree/3"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(tree["chunkId"], 3);
    assert_eq!(tree["leafCount"], 1);
    assert_eq!(tree["root"], serde_json::json!(poseidon::fr_to_dec(
        agent.engine.root(3).unwrap()
    )));

    let missing = reqwest::get(format!("{base}/tree/99")).await.unwrap();
    assert_eq!(missing.status(), 404);
    let body: serde_json::Value = missing.json().await.unwrap();
    assert_eq!(body["error"], "Tree not found");

    let health: serde_json::Value = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["chunks"], serde_json::json!([3]));
}
