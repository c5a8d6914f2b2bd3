//! Agent orchestrator.
//!
//! Owns the lifecycle of every subsystem (deposit book, Merkle engine, DHT,
//! HTTP surface, LAN beacon, relayer queue) and drives the two user-facing
//! flows plus the auto-mix loop. Generic over the chain and prover ports so
//! tests run the full pipeline against in-memory doubles.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ark_bn254::Fr;
use futures::future::join_all;
use rand::rngs::OsRng;
use rand::RngCore;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::beacon::LanBeacon;
use crate::book::{DepositBook, WITHDRAW_REF_PENDING};
use crate::chain::{ChainClient, ProofBundle};
use crate::codec::DepositCode;
use crate::config::Config;
use crate::constants::{
    CHAIN_CALL_TIMEOUT_MS, MIX_COOLDOWN_SECS, PEER_CLEANUP_INTERVAL_SECS,
    REANNOUNCE_INTERVAL_SECS, RELAYER_STATUS_PROBE_MS, RELAYER_SUBMIT_TIMEOUT_MS,
};
use crate::dht::{DhtNode, NodeId};
use crate::error::{AgentError, AgentResult};
use crate::merkle::{ChunkTree, MerkleEngine, TreeSnapshot};
use crate::metrics::metrics;
use crate::peers::{KnownPeer, PeerBook};
use crate::poseidon::{self, fr_from_be_bytes, fr_to_dec};
use crate::prover::{DepositWitness, Prover, WithdrawWitness};
use crate::rate_limit::RateLimiter;
use crate::relay_queue::RelayQueue;
use crate::state::AppState;
use crate::tree_fetch::TreeFetcher;
use crate::wallet;

fn chain_deadline() -> Duration {
    Duration::from_millis(CHAIN_CALL_TIMEOUT_MS)
}

#[derive(Debug, Clone)]
pub struct DepositOutcome {
    pub tx_id: String,
    pub commitment: String,
    pub deposit_code: String,
}

#[derive(Debug, Clone)]
pub struct WithdrawOutcome {
    /// Relayer queue id (remote or local) now referenced by the book.
    pub reference: String,
    pub relayer: Option<String>,
}

pub struct AgentNode<C: ChainClient, P: Prover> {
    cfg: Config,
    chain: Arc<C>,
    prover: Arc<P>,
    pub engine: Arc<MerkleEngine>,
    pub book: Arc<DepositBook>,
    pub dht: Arc<DhtNode>,
    pub peers: Arc<PeerBook>,
    pub queue: Arc<RelayQueue>,
    wallet: Arc<Keypair>,
    fetcher: TreeFetcher,
    http: reqwest::Client,
    http_port: AtomicU16,
    stop: AtomicBool,
}

impl<C: ChainClient, P: Prover> AgentNode<C, P> {
    pub fn new(cfg: Config, chain: Arc<C>, prover: Arc<P>) -> AgentResult<Arc<Self>> {
        // Eager Poseidon setup: no first-operation timing fingerprint.
        poseidon::warm_up();

        let wallet = match &cfg.wallet_path {
            Some(path) => wallet::load_override(path)?,
            None => wallet::load_or_create(&cfg.data_dir)?,
        };
        let engine = Arc::new(MerkleEngine::new(&cfg.data_dir));
        let book = Arc::new(DepositBook::open(&cfg.data_dir)?);
        let peers = Arc::new(PeerBook::open(&cfg.data_dir, cfg.production)?);
        let queue = RelayQueue::new(cfg.relay_min_delay_ms, cfg.relay_max_delay_ms);
        let dht = DhtNode::new(NodeId::random(), cfg.production);
        let fetcher = TreeFetcher::new(Arc::clone(&peers));

        Ok(Arc::new(Self {
            cfg,
            chain,
            prover,
            engine,
            book,
            dht,
            peers,
            queue,
            wallet: Arc::new(wallet),
            fetcher,
            http: reqwest::Client::new(),
            http_port: AtomicU16::new(0),
            stop: AtomicBool::new(false),
        }))
    }

    pub fn http_port(&self) -> u16 {
        self.http_port.load(Ordering::Relaxed)
    }

    pub fn wallet_pubkey(&self) -> String {
        self.wallet.pubkey().to_string()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------

    /// Bring up every background task. Returns the bound HTTP port.
    pub async fn start(self: &Arc<Self>) -> AgentResult<u16> {
        self.dht.start(self.cfg.dht_port).await?;

        // The HTTP port is shared by the tree-sharing and relayer surfaces;
        // walk forward a little when the configured port is taken.
        let mut listener = None;
        for offset in 0..10u16 {
            let port = match self.cfg.http_port {
                0 => 0,
                p => p.saturating_add(offset),
            };
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(l) => {
                    listener = Some(l);
                    break;
                }
                Err(e) if self.cfg.http_port != 0 => {
                    debug!(port, error = %e, "http bind failed, trying next port");
                }
                Err(e) => return Err(AgentError::Network(format!("http bind failed: {e}"))),
            }
        }
        let listener = listener
            .ok_or_else(|| AgentError::Network("no free http port in range".to_string()))?;
        let http_port = listener
            .local_addr()
            .map_err(|e| AgentError::Network(e.to_string()))?
            .port();
        self.http_port.store(http_port, Ordering::Relaxed);

        let state = Arc::new(AppState {
            engine: Arc::clone(&self.engine),
            peers: Arc::clone(&self.peers),
            queue: Arc::clone(&self.queue),
            rate_limiter: std::sync::Mutex::new(RateLimiter::from_defaults()),
            http_port,
            fee: 0,
        });
        let app = crate::router::build(state);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
            )
            .await
            {
                error!(error = %e, "http server exited");
            }
        });
        info!(port = http_port, "http surface listening");

        // Relayer queue processor.
        tokio::spawn(Arc::clone(&self.queue).run(Arc::clone(&self.chain)));

        // LAN beacon (best-effort; a bound beacon port is not fatal to miss).
        match LanBeacon::bind(
            self.cfg.beacon_port,
            http_port,
            Arc::clone(&self.engine),
            Arc::clone(&self.peers),
        )
        .await
        {
            Ok(beacon) => {
                tokio::spawn(beacon.run());
            }
            Err(e) => warn!(error = %e, "lan beacon disabled"),
        }

        // Peer-book cleanup timer.
        {
            let peers = Arc::clone(&self.peers);
            let dht = Arc::clone(&self.dht);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(
                    PEER_CLEANUP_INTERVAL_SECS,
                ));
                loop {
                    ticker.tick().await;
                    peers.cleanup();
                    metrics().known_peers.set(peers.len() as i64);
                    metrics().dht_peers.set(dht.peer_count() as i64);
                }
            });
        }

        // Bootstrap, then announce now and on a timer.
        if let Some(seed) = self.cfg.bootstrap_peer.clone() {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                match seed.rsplit_once(':').and_then(|(h, p)| {
                    p.parse::<u16>().ok().map(|p| (h.to_string(), p))
                }) {
                    Some((host, port)) => {
                        if let Err(e) = node.dht.bootstrap(&host, port).await {
                            warn!(seed = %seed, error = %e, "dht bootstrap failed");
                        }
                        node.announce().await;
                    }
                    None => warn!(seed = %seed, "unparseable bootstrap peer, expected host:port"),
                }
            });
        } else {
            let node = Arc::clone(self);
            tokio::spawn(async move { node.announce().await });
        }
        {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(REANNOUNCE_INTERVAL_SECS));
                ticker.tick().await; // immediate tick already handled above
                loop {
                    ticker.tick().await;
                    node.announce().await;
                }
            });
        }

        Ok(http_port)
    }

    async fn announce(&self) {
        self.dht
            .announce(self.http_port(), self.cfg.public_host.as_deref())
            .await;
    }

    /// Merge DHT agent records into the peer book so relayer selection and
    /// tree fetching can use them.
    pub async fn refresh_agents(&self) -> usize {
        let records = self.dht.find_agents().await;
        let mut added = 0;
        for record in &records {
            let (Some(host), Some(port)) = (
                record.get("host").and_then(|v| v.as_str()),
                record.get("http_port").and_then(|v| v.as_u64()),
            ) else {
                continue;
            };
            let Ok(port) = u16::try_from(port) else {
                continue;
            };
            if self.peers.observe(host, port, Default::default()) {
                added += 1;
            }
        }
        debug!(records = records.len(), added, "merged dht agent records");
        added
    }

    // -----------------------------------------------------------------
    // Tree loading
    // -----------------------------------------------------------------

    /// Root check for replicas that came from disk or a peer. Unavailable
    /// chain means the replica is accepted as-is (availability wins when
    /// offline); a reachable chain with a different root rejects it.
    async fn root_matches_chain(&self, chunk_id: u32, root: Fr) -> bool {
        match self.chain.fetch_root(chunk_id, chain_deadline()).await {
            Ok(chain_root) => chain_root == root,
            Err(AgentError::NotFound(_)) => true, // chunk account not created yet
            Err(e) => {
                warn!(chunk_id, error = %e, "root check skipped, chain unreachable");
                true
            }
        }
    }

    /// Cache -> peer -> chain ladder from §tree-load. Every path that
    /// changes the replica refreshes the disk cache.
    pub async fn load_tree(&self, chunk_id: u32) -> AgentResult<()> {
        let chain_count = self
            .chain
            .leaf_count(chunk_id, chain_deadline())
            .await? as usize;
        let local_count = self.engine.leaf_count(chunk_id);

        // 1-2. In-memory replica already current.
        if local_count == Some(chain_count) {
            return Ok(());
        }

        // 3. Strict prefix: incremental update over fresh chain leaves.
        if let Some(local) = local_count {
            if local < chain_count {
                let leaves = self.chain.fetch_leaves(chunk_id, chain_deadline()).await?;
                self.engine.update(chunk_id, &leaves)?;
                self.engine.save_cache(chunk_id)?;
                return Ok(());
            }
        }

        // 4. Disk cache.
        if let Some(snapshot) = self.engine.load_cache(chunk_id) {
            if snapshot.leaf_count == chain_count {
                match self.install_snapshot(chunk_id, snapshot, false).await {
                    Ok(()) => return Ok(()),
                    Err(e) => debug!(chunk_id, error = %e, "disk cache discarded"),
                }
            }
        }

        // 5. Peer layer.
        if let Ok(snapshot) = self.fetcher.fetch_complete_tree(chunk_id).await {
            if snapshot.leaf_count == chain_count {
                match self.install_snapshot(chunk_id, snapshot, true).await {
                    Ok(()) => return Ok(()),
                    Err(e) => warn!(chunk_id, error = %e, "peer tree rejected"),
                }
            }
        }

        // 6. Chain leaves, full build.
        let leaves = self.chain.fetch_leaves(chunk_id, chain_deadline()).await?;
        let tree = tokio::task::spawn_blocking(move || ChunkTree::build(leaves))
            .await
            .map_err(|e| AgentError::Disk(format!("build task join: {e}")))??;
        self.engine.install(chunk_id, tree);
        self.engine.save_cache(chunk_id)?;
        Ok(())
    }

    async fn install_snapshot(
        &self,
        chunk_id: u32,
        snapshot: TreeSnapshot,
        refresh_cache: bool,
    ) -> AgentResult<()> {
        // A leaves-only snapshot (no internal nodes but real leaves) is
        // rebuilt; a full one installs without rehashing.
        let tree = if snapshot.tree.is_empty() && !snapshot.leaves.is_empty() {
            let leaves = snapshot
                .leaves
                .iter()
                .map(|s| poseidon::fr_from_dec(s))
                .collect::<AgentResult<Vec<Fr>>>()?;
            tokio::task::spawn_blocking(move || ChunkTree::build(leaves))
                .await
                .map_err(|e| AgentError::Disk(format!("build task join: {e}")))??
        } else {
            snapshot.into_tree()?
        };
        if !self.root_matches_chain(chunk_id, tree.root()).await {
            return Err(AgentError::Integrity(
                "replica root disagrees with chain".to_string(),
            ));
        }
        self.engine.install(chunk_id, tree);
        if refresh_cache {
            self.engine.save_cache(chunk_id)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Deposit
    // -----------------------------------------------------------------

    pub async fn deposit(&self) -> AgentResult<DepositOutcome> {
        let amount = self.cfg.denomination;
        let mut nullifier = [0u8; 32];
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut nullifier);
        OsRng.fill_bytes(&mut secret);
        let nullifier_fr = fr_from_be_bytes(&nullifier);
        let secret_fr = fr_from_be_bytes(&secret);
        let commitment = poseidon::commitment(nullifier_fr, secret_fr, amount);

        let chunk_id = self.chain.current_chunk_id(chain_deadline()).await?;
        let bundle = self
            .prover
            .prove_deposit(&DepositWitness {
                nullifier: nullifier_fr,
                secret: secret_fr,
                amount,
            })
            .await?;
        let tx_id = self
            .chain
            .submit_deposit(&bundle, amount, chunk_id, chain_deadline())
            .await?;

        // Only after chain acceptance does the code exist anywhere durable.
        let code = DepositCode {
            nullifier,
            secret,
            chunk_id,
            amount,
        }
        .encode();
        let commitment_dec = fr_to_dec(commitment);
        self.book.add(&code, &commitment_dec, amount, &tx_id).await?;
        metrics().deposits_total.inc();

        if self.cfg.debug_secrets {
            debug!(%tx_id, commitment = %commitment_dec, deposit_code = %code, "deposit complete");
        } else {
            info!(%tx_id, chunk_id, "deposit complete");
        }
        Ok(DepositOutcome {
            tx_id,
            commitment: commitment_dec,
            deposit_code: code,
        })
    }

    // -----------------------------------------------------------------
    // Withdraw
    // -----------------------------------------------------------------

    pub async fn withdraw(&self, amount: u64, recipient: &str) -> AgentResult<WithdrawOutcome> {
        let record = self
            .book
            .find_unwithdrawn(Some(amount))
            .await?
            .ok_or_else(|| {
                AgentError::NotFound(format!("no pending deposit of {amount} base units"))
            })?;
        let code = DepositCode::decode(&record.code)?;
        self.load_tree(code.chunk_id).await?;

        let nullifier_fr = fr_from_be_bytes(&code.nullifier);
        let secret_fr = fr_from_be_bytes(&code.secret);
        let commitment = poseidon::commitment(nullifier_fr, secret_fr, code.amount);
        // Linear scan over in-memory leaves. Known timing side channel;
        // acceptable for the deployment sizes this agent targets.
        let leaf_index = self
            .engine
            .find_leaf(code.chunk_id, commitment)
            .ok_or_else(|| {
                AgentError::NotFound("commitment not found in chunk tree".to_string())
            })?;
        let path = self.engine.path(code.chunk_id, leaf_index)?;

        let bundle = self
            .prover
            .prove_withdraw(&WithdrawWitness {
                nullifier: nullifier_fr,
                secret: secret_fr,
                amount: code.amount,
                recipient: recipient.to_string(),
                fee: 0,
                path,
            })
            .await?;

        // Nobody in the peer book yet: pull rendezvous records off the DHT
        // before settling for self-service.
        if self.peers.is_empty() {
            self.refresh_agents().await;
        }
        let relayer = self.select_relayer().await;

        // Pre-mark before anything leaves this process: a crash mid-POST
        // must never leave a spendable-looking deposit behind.
        self.book
            .mark_withdrawn(&record.code, WITHDRAW_REF_PENDING)
            .await?;

        let outcome = match &relayer {
            Some(peer) => {
                self.submit_to_relayer(peer, &bundle, recipient, code.amount, code.chunk_id)
                    .await
            }
            None => {
                // Self-service fallback: our own queue relays it.
                let (queue_id, _execute_at) = self.queue.push(
                    bundle.clone(),
                    recipient.to_string(),
                    code.amount,
                    code.chunk_id,
                );
                Ok(queue_id)
            }
        };

        match outcome {
            Ok(reference) => {
                self.book
                    .update_withdraw_ref(&record.code, &reference)
                    .await?;
                metrics().withdraws_total.inc();
                info!(
                    reference = %reference,
                    relayer = relayer.as_ref().map(|p| p.addr()).unwrap_or_else(|| "self".into()),
                    "withdraw routed"
                );
                Ok(WithdrawOutcome {
                    reference,
                    relayer: relayer.map(|p| p.addr()),
                })
            }
            Err(e) => {
                // Rollback happens-before returning to the caller.
                if let Err(rollback) = self.book.clear_withdrawn(&record.code).await {
                    error!(error = %rollback, "withdraw rollback failed, deposit stays flagged");
                }
                Err(e)
            }
        }
    }

    async fn submit_to_relayer(
        &self,
        peer: &KnownPeer,
        bundle: &ProofBundle,
        recipient: &str,
        amount: u64,
        chunk_id: u32,
    ) -> AgentResult<String> {
        let body = serde_json::json!({
            "proof": bundle,
            "recipient": recipient,
            "amount": amount,
            "chunkId": chunk_id,
        });
        let resp = self
            .http
            .post(format!("{}/relayer/submit", peer.base_url()))
            .timeout(Duration::from_millis(RELAYER_SUBMIT_TIMEOUT_MS))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AgentError::Timeout(format!("relayer {}", peer.addr()))
                } else {
                    AgentError::Network(format!("relayer {}: {e}", peer.addr()))
                }
            })?;
        if !resp.status().is_success() {
            return Err(AgentError::Network(format!(
                "relayer {} answered {}",
                peer.addr(),
                resp.status()
            )));
        }
        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AgentError::Network(format!("relayer reply unreadable: {e}")))?;
        value
            .get("queueId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| AgentError::Network("relayer reply had no queueId".to_string()))
    }

    /// Probe every known peer's `/relayer/status` concurrently (2 s cap)
    /// and pick the shortest queue. `None` means self-service.
    pub async fn select_relayer(&self) -> Option<KnownPeer> {
        let peers = self.peers.all();
        if peers.is_empty() {
            return None;
        }
        let probes = peers.iter().map(|peer| {
            let url = format!("{}/relayer/status", peer.base_url());
            let http = self.http.clone();
            async move {
                let resp = http
                    .get(&url)
                    .timeout(Duration::from_millis(RELAYER_STATUS_PROBE_MS))
                    .send()
                    .await
                    .ok()?;
                let value: serde_json::Value = resp.json().await.ok()?;
                let queue_length = value.get("queueLength")?.as_u64()?;
                Some(queue_length)
            }
        });
        let results = join_all(probes).await;
        peers
            .into_iter()
            .zip(results)
            .filter_map(|(peer, queue_length)| queue_length.map(|q| (peer, q)))
            .min_by_key(|(_, q)| *q)
            .map(|(peer, _)| peer)
    }

    // -----------------------------------------------------------------
    // Auto-mix loop
    // -----------------------------------------------------------------

    async fn mix_wait(&self, min_ms: u64, max_ms: u64) {
        let wait = crate::relay_queue::draw_delay_ms(min_ms, max_ms);
        tokio::time::sleep(Duration::from_millis(wait)).await;
    }

    async fn mix_iteration(&self) -> AgentResult<()> {
        let balance = self.chain.balance(chain_deadline()).await?;
        if balance < self.cfg.denomination {
            return Err(AgentError::Capacity(format!(
                "balance {balance} below denomination {}",
                self.cfg.denomination
            )));
        }
        self.deposit().await?;
        self.mix_wait(self.cfg.withdraw_wait_min_ms, self.cfg.withdraw_wait_max_ms)
            .await;

        let chunk_id = self.chain.current_chunk_id(chain_deadline()).await?;
        self.load_tree(chunk_id).await?;

        // Fresh key per withdraw; linkable reuse defeats the mixer.
        let recipient = Keypair::new().pubkey().to_string();
        self.withdraw(self.cfg.denomination, &recipient).await?;
        self.mix_wait(self.cfg.deposit_wait_min_ms, self.cfg.deposit_wait_max_ms)
            .await;
        Ok(())
    }

    /// Deposit/withdraw forever, with CSPRNG pacing. Per-iteration failures
    /// log and cool down; the loop honors the stop flag at its boundaries
    /// and an optional wall-clock deadline.
    pub async fn run_auto_mix(self: &Arc<Self>) {
        let deadline = self
            .cfg
            .mix_deadline_secs
            .map(|s| tokio::time::Instant::now() + Duration::from_secs(s));
        info!("auto-mix loop started");
        loop {
            if self.stopped() {
                break;
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    info!("auto-mix deadline reached");
                    break;
                }
            }
            if let Err(e) = self.mix_iteration().await {
                warn!(error = %e, "mix iteration failed, cooling down");
                tokio::time::sleep(Duration::from_secs(MIX_COOLDOWN_SECS)).await;
            }
        }
        info!("auto-mix loop stopped");
    }
}
