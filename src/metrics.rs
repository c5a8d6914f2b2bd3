use std::sync::OnceLock;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

pub struct Metrics {
    registry: Registry,
    pub deposits_total: Counter,
    pub withdraws_total: Counter,
    pub relay_accepted_total: Counter,
    pub relay_rejected_total: Counter,
    pub relay_retries_total: Counter,
    pub queue_length: Gauge<i64>,
    pub dht_peers: Gauge<i64>,
    pub known_peers: Gauge<i64>,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let mut registry = Registry::default();

        let deposits_total = Counter::default();
        registry.register("agent_deposits_total", "Deposits submitted", deposits_total.clone());
        let withdraws_total = Counter::default();
        registry.register(
            "agent_withdraws_total",
            "Withdraws routed to a relayer",
            withdraws_total.clone(),
        );
        let relay_accepted_total = Counter::default();
        registry.register(
            "agent_relay_accepted_total",
            "Relayer submissions accepted into the queue",
            relay_accepted_total.clone(),
        );
        let relay_rejected_total = Counter::default();
        registry.register(
            "agent_relay_rejected_total",
            "Relayer submissions rejected (validation or rate limit)",
            relay_rejected_total.clone(),
        );
        let relay_retries_total = Counter::default();
        registry.register(
            "agent_relay_retries_total",
            "Queue entries re-armed after a failed chain submission",
            relay_retries_total.clone(),
        );
        let queue_length = Gauge::<i64>::default();
        registry.register("agent_queue_length", "Relayer queue length", queue_length.clone());
        let dht_peers = Gauge::<i64>::default();
        registry.register("agent_dht_peers", "Peers in the routing table", dht_peers.clone());
        let known_peers = Gauge::<i64>::default();
        registry.register(
            "agent_known_peers",
            "Peers in the tree-sharing peer book",
            known_peers.clone(),
        );

        Metrics {
            registry,
            deposits_total,
            withdraws_total,
            relay_accepted_total,
            relay_rejected_total,
            relay_retries_total,
            queue_length,
            dht_peers,
            known_peers,
        }
    })
}

pub async fn metrics_handler() -> impl IntoResponse {
    let mut body = String::new();
    if encode(&mut body, &metrics().registry).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (StatusCode::OK, body)
}
