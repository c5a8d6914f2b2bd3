//! DHT node: transport, routing-table maintenance and the iterative
//! operations (lookup, announce, find-agents, bootstrap).
//!
//! Transport model: every peer runs a TCP server on the DHT port;
//! connections are persistent and multiplexed. A per-connection reader task
//! routes response frames to the pending-RPC map by transaction id and
//! answers request frames inline; writes funnel through a per-connection
//! channel. Total connections (inbound + outbound) are capped by a
//! semaphore; idle connections die after 60 s.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, info, trace, warn};

use crate::constants::{
    BUCKET_SIZE, IDLE_CONN_TIMEOUT_MS, LOOKUP_ALPHA, LOOKUP_MAX_ROUNDS, MAX_TRANSPORT_CONNS,
    NETWORK_ID, RPC_TIMEOUT_MS,
};
use crate::dht::bucket::RoutingTable;
use crate::dht::id::{cmp_distance, key_target, NodeId};
use crate::dht::peer::{validate_endpoint, DhtPeer};
use crate::dht::protocol::{
    read_frame, write_frame, FindNodeData, FindValueData, Frame, FrameRead, MessageKind,
    NodeEntry, NodesData, StoreData, ValueData,
};
use crate::error::{AgentError, AgentResult};
use crate::utils::{canonical_json, now_ms, random_id64};

/// Records kept per key; enough for every agent on a small network without
/// letting one key grow without bound.
const MAX_VALUES_PER_KEY: usize = 64;

struct ConnHandle {
    tx: mpsc::Sender<Frame>,
}

pub struct DhtNode {
    id: NodeId,
    production: bool,
    port: AtomicU16,
    table: Mutex<RoutingTable>,
    store: Mutex<HashMap<String, Vec<serde_json::Value>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Frame>>>,
    conns: tokio::sync::Mutex<HashMap<String, ConnHandle>>,
    conn_slots: Arc<Semaphore>,
}

impl DhtNode {
    pub fn new(id: NodeId, production: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            production,
            port: AtomicU16::new(0),
            table: Mutex::new(RoutingTable::new(id, production)),
            store: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            conns: tokio::sync::Mutex::new(HashMap::new()),
            conn_slots: Arc::new(Semaphore::new(MAX_TRANSPORT_CONNS)),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Relaxed)
    }

    pub fn peer_count(&self) -> usize {
        self.table.lock().expect("table lock").len()
    }

    pub fn known_peers(&self) -> Vec<DhtPeer> {
        self.table.lock().expect("table lock").all_peers()
    }

    // -----------------------------------------------------------------
    // Server
    // -----------------------------------------------------------------

    /// Bind the DHT port (0 picks an ephemeral one) and spawn the accept
    /// loop. Returns the bound port.
    pub async fn start(self: &Arc<Self>, port: u16) -> AgentResult<u16> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| AgentError::Network(format!("dht bind failed: {e}")))?;
        let bound = listener
            .local_addr()
            .map_err(|e| AgentError::Network(e.to_string()))?
            .port();
        self.port.store(bound, Ordering::Relaxed);
        info!(port = bound, id = %self.id.to_hex(), "dht server listening");
        let node = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "dht accept failed");
                        continue;
                    }
                };
                let Ok(permit) = Arc::clone(&node.conn_slots).try_acquire_owned() else {
                    trace!(%addr, "connection limit reached, dropping inbound");
                    continue;
                };
                node.spawn_connection(stream, addr.ip().to_string(), None, permit);
            }
        });
        Ok(bound)
    }

    fn spawn_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        remote_host: String,
        conn_key: Option<String>,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) -> mpsc::Sender<Frame> {
        let (mut reader, writer) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Frame>(32);

        tokio::spawn(async move {
            let mut writer: OwnedWriteHalf = writer;
            while let Some(frame) = rx.recv().await {
                if write_frame(&mut writer, &frame).await.is_err() {
                    break;
                }
            }
        });

        let node = Arc::clone(self);
        let reply_tx = tx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let idle = Duration::from_millis(IDLE_CONN_TIMEOUT_MS);
            loop {
                match tokio::time::timeout(idle, read_frame(&mut reader)).await {
                    Err(_) => {
                        trace!(host = %remote_host, "idle connection closed");
                        break;
                    }
                    Ok(Err(_)) | Ok(Ok(FrameRead::Eof)) => break,
                    Ok(Ok(FrameRead::Skip)) => continue,
                    Ok(Ok(FrameRead::Msg(frame))) => {
                        node.on_frame(frame, &remote_host, &reply_tx).await;
                    }
                }
            }
            if let Some(key) = conn_key {
                node.conns.lock().await.remove(&key);
            }
        });

        tx
    }

    async fn on_frame(&self, frame: Frame, remote_host: &str, reply_tx: &mpsc::Sender<Frame>) {
        // Routing-table maintenance: any valid inbound message refreshes the
        // sender, requests and responses alike. Peers that never sent us
        // anything are never inserted.
        if let (Ok(sender), Some(port)) = (NodeId::from_hex(&frame.id), frame.port) {
            if sender != self.id {
                let peer = DhtPeer::new(sender, remote_host, port);
                self.table.lock().expect("table lock").touch(peer);
            }
        }

        match frame.kind {
            MessageKind::Pong
            | MessageKind::Nodes
            | MessageKind::Stored
            | MessageKind::Value => {
                if let Some(tx_id) = frame.tx_id.clone() {
                    let waiter = self.pending.lock().expect("pending lock").remove(&tx_id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(frame);
                        }
                        None => trace!(%tx_id, "response with no pending request"),
                    }
                }
            }
            MessageKind::Ping
            | MessageKind::FindNode
            | MessageKind::Store
            | MessageKind::FindValue => {
                if let Some(mut reply) = self.answer(&frame, remote_host) {
                    reply.port = Some(self.port());
                    let _ = reply_tx.send(reply).await;
                }
            }
        }
    }

    fn answer(&self, frame: &Frame, remote_host: &str) -> Option<Frame> {
        let self_hex = self.id.to_hex();
        match frame.kind {
            MessageKind::Ping => Some(frame.reply(MessageKind::Pong, &self_hex, None)),
            MessageKind::FindNode => {
                let data: FindNodeData = frame.parse_data()?;
                let target = NodeId::from_hex(&data.target).ok()?;
                Some(frame.reply(
                    MessageKind::Nodes,
                    &self_hex,
                    Some(self.closest_entries(target)),
                ))
            }
            MessageKind::Store => {
                let mut data: StoreData = frame.parse_data()?;
                // Record where the record actually came from; announcers
                // behind NAT rarely know their own address.
                if let Some(obj) = data.value.as_object_mut() {
                    obj.entry("host".to_string())
                        .or_insert_with(|| serde_json::Value::String(remote_host.to_string()));
                }
                self.store_value(&data.key, data.value);
                Some(frame.reply(MessageKind::Stored, &self_hex, None))
            }
            MessageKind::FindValue => {
                let data: FindValueData = frame.parse_data()?;
                let values = self
                    .store
                    .lock()
                    .expect("store lock")
                    .get(&data.key)
                    .cloned()
                    .unwrap_or_default();
                if values.is_empty() {
                    // Same shape as FIND_NODE: the K closest to SHA-256(key).
                    Some(frame.reply(
                        MessageKind::Nodes,
                        &self_hex,
                        Some(self.closest_entries(key_target(&data.key))),
                    ))
                } else {
                    Some(frame.reply(
                        MessageKind::Value,
                        &self_hex,
                        serde_json::to_value(ValueData { values }).ok(),
                    ))
                }
            }
            _ => None,
        }
    }

    fn closest_entries(&self, target: NodeId) -> serde_json::Value {
        let nodes: Vec<NodeEntry> = self
            .table
            .lock()
            .expect("table lock")
            .closest(target, BUCKET_SIZE)
            .into_iter()
            .map(|p| NodeEntry {
                id: p.id,
                host: p.host,
                port: p.port,
            })
            .collect();
        serde_json::to_value(NodesData { nodes }).unwrap_or(serde_json::Value::Null)
    }

    fn store_value(&self, key: &str, value: serde_json::Value) {
        let mut store = self.store.lock().expect("store lock");
        let values = store.entry(key.to_string()).or_default();
        let node_id = value.get("node_id").cloned();
        if let Some(node_id) = node_id {
            // One record per announcing node; the newest wins.
            values.retain(|v| v.get("node_id") != Some(&node_id));
        } else {
            let canon = canonical_json(&value);
            values.retain(|v| canonical_json(v) != canon);
        }
        values.push(value);
        if values.len() > MAX_VALUES_PER_KEY {
            let excess = values.len() - MAX_VALUES_PER_KEY;
            values.drain(..excess);
        }
    }

    // -----------------------------------------------------------------
    // Outbound RPC
    // -----------------------------------------------------------------

    async fn conn_to(self: &Arc<Self>, host: &str, port: u16) -> AgentResult<mpsc::Sender<Frame>> {
        let key = format!("{host}:{port}");
        if let Some(handle) = self.conns.lock().await.get(&key) {
            if !handle.tx.is_closed() {
                return Ok(handle.tx.clone());
            }
        }
        let permit = Arc::clone(&self.conn_slots)
            .try_acquire_owned()
            .map_err(|_| AgentError::Capacity("transport connection limit".to_string()))?;
        let stream = tokio::time::timeout(
            Duration::from_millis(RPC_TIMEOUT_MS),
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| AgentError::Timeout(format!("connect {key}")))?
        .map_err(|e| AgentError::Network(format!("connect {key}: {e}")))?;
        let tx = self.spawn_connection(stream, host.to_string(), Some(key.clone()), permit);
        self.conns
            .lock()
            .await
            .insert(key, ConnHandle { tx: tx.clone() });
        Ok(tx)
    }

    /// Send one request and await its matched response. Responses pair with
    /// requests strictly by transaction id; a timeout releases the pending
    /// slot.
    pub async fn send_request(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        kind: MessageKind,
        data: Option<serde_json::Value>,
    ) -> AgentResult<Frame> {
        let tx_id = random_id64();
        let mut frame = Frame::request(kind, &self.id.to_hex(), &tx_id, data);
        frame.port = Some(self.port());

        let (done_tx, done_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock")
            .insert(tx_id.clone(), done_tx);

        let sent = match self.conn_to(host, port).await {
            Ok(conn) => conn.send(frame).await.is_ok(),
            Err(e) => {
                self.pending.lock().expect("pending lock").remove(&tx_id);
                return Err(e);
            }
        };
        if !sent {
            self.pending.lock().expect("pending lock").remove(&tx_id);
            return Err(AgentError::Network(format!("connection to {host}:{port} died")));
        }

        match tokio::time::timeout(Duration::from_millis(RPC_TIMEOUT_MS), done_rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => {
                self.pending.lock().expect("pending lock").remove(&tx_id);
                Err(AgentError::Network("response channel dropped".to_string()))
            }
            Err(_) => {
                self.pending.lock().expect("pending lock").remove(&tx_id);
                Err(AgentError::Timeout(format!("rpc to {host}:{port}")))
            }
        }
    }

    // -----------------------------------------------------------------
    // Iterative operations
    // -----------------------------------------------------------------

    /// Iterative FIND_NODE convergence toward `target`. The shortlist only
    /// ever grows, so the best known distance is monotonically improving.
    pub async fn lookup(self: &Arc<Self>, target: NodeId) -> Vec<DhtPeer> {
        let mut shortlist: Vec<DhtPeer> = self
            .table
            .lock()
            .expect("table lock")
            .closest(target, BUCKET_SIZE);
        let mut queried: HashSet<String> = HashSet::new();

        for _round in 0..LOOKUP_MAX_ROUNDS {
            let batch: Vec<DhtPeer> = shortlist
                .iter()
                .filter(|p| !queried.contains(&p.id))
                .take(LOOKUP_ALPHA)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }
            for p in &batch {
                queried.insert(p.id.clone());
            }
            let queries = batch.iter().map(|p| {
                let node = Arc::clone(self);
                let data = serde_json::to_value(FindNodeData {
                    target: target.to_hex(),
                })
                .ok();
                async move {
                    node.send_request(&p.host, p.port, MessageKind::FindNode, data)
                        .await
                }
            });
            for result in join_all(queries).await {
                let Ok(frame) = result else {
                    continue; // timed-out peers stay marked queried and are skipped
                };
                let Some(nodes) = frame.parse_data::<NodesData>() else {
                    continue;
                };
                for entry in nodes.nodes {
                    let Ok(id) = NodeId::from_hex(&entry.id) else {
                        continue;
                    };
                    if id == self.id
                        || validate_endpoint(&entry.host, entry.port, self.production).is_err()
                        || shortlist.iter().any(|p| p.id == entry.id)
                    {
                        continue;
                    }
                    shortlist.push(DhtPeer::new(id, &entry.host, entry.port));
                }
            }
            shortlist.sort_by(|a, b| {
                match (a.node_id(), b.node_id()) {
                    (Ok(ia), Ok(ib)) => cmp_distance(ia, ib, target),
                    _ => std::cmp::Ordering::Equal,
                }
            });
        }

        shortlist.sort_by(|a, b| match (a.node_id(), b.node_id()) {
            (Ok(ia), Ok(ib)) => cmp_distance(ia, ib, target),
            _ => std::cmp::Ordering::Equal,
        });
        shortlist.truncate(BUCKET_SIZE);
        shortlist
    }

    /// Publish our rendezvous record under the network key to the K closest
    /// nodes. Individual failures are absorbed; announcing to nobody is fine
    /// on an isolated node (the record still lands in our own store).
    pub async fn announce(self: &Arc<Self>, http_port: u16, public_host: Option<&str>) {
        let mut record = serde_json::json!({
            "node_id": self.id.to_hex(),
            "http_port": http_port,
            "timestamp": now_ms() as u64,
        });
        if let Some(host) = public_host {
            record["host"] = serde_json::Value::String(host.to_string());
        }
        // We are always among the closest we know of.
        self.store_value(NETWORK_ID, record.clone());

        let closest = self.lookup(key_target(NETWORK_ID)).await;
        let stores = closest.iter().map(|p| {
            let node = Arc::clone(self);
            let data = serde_json::to_value(StoreData {
                key: NETWORK_ID.to_string(),
                value: record.clone(),
            })
            .ok();
            async move {
                node.send_request(&p.host, p.port, MessageKind::Store, data)
                    .await
            }
        });
        let results = join_all(stores).await;
        let ok = results.iter().filter(|r| r.is_ok()).count();
        debug!(stored = ok, targets = closest.len(), "dht announce");
    }

    /// Collect every distinct agent record published under the network key.
    pub async fn find_agents(self: &Arc<Self>) -> Vec<serde_json::Value> {
        let closest = self.lookup(key_target(NETWORK_ID)).await;
        let queries = closest.iter().map(|p| {
            let node = Arc::clone(self);
            let data = serde_json::to_value(FindValueData {
                key: NETWORK_ID.to_string(),
            })
            .ok();
            async move {
                node.send_request(&p.host, p.port, MessageKind::FindValue, data)
                    .await
            }
        });

        let mut seen: HashSet<String> = HashSet::new();
        let mut agents = Vec::new();
        let mut push = |value: serde_json::Value, seen: &mut HashSet<String>, out: &mut Vec<_>| {
            if seen.insert(canonical_json(&value)) {
                out.push(value);
            }
        };
        for value in self
            .store
            .lock()
            .expect("store lock")
            .get(NETWORK_ID)
            .cloned()
            .unwrap_or_default()
        {
            push(value, &mut seen, &mut agents);
        }
        for result in join_all(queries).await {
            let Ok(frame) = result else { continue };
            if frame.kind != MessageKind::Value {
                continue;
            }
            let Some(data) = frame.parse_data::<ValueData>() else {
                continue;
            };
            for value in data.values {
                push(value, &mut seen, &mut agents);
            }
        }
        agents
    }

    /// Join the network through one seed peer: validate, PING (the PONG
    /// inserts the seed through the touch path), then look up our own id to
    /// populate nearby buckets.
    pub async fn bootstrap(self: &Arc<Self>, host: &str, port: u16) -> AgentResult<()> {
        validate_endpoint(host, port, self.production)?;
        let pong = self
            .send_request(host, port, MessageKind::Ping, None)
            .await?;
        if pong.kind != MessageKind::Pong {
            return Err(AgentError::Network("seed peer sent a non-PONG".to_string()));
        }
        let found = self.lookup(self.id).await;
        info!(seed = %format!("{host}:{port}"), peers = found.len(), "dht bootstrap complete");
        Ok(())
    }
}
