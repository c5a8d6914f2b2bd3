use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::constants::MAX_SUBMIT_BODY_BYTES;
use crate::handlers;
use crate::state::AppState;

pub fn build(state: Arc<AppState>) -> Router {
    // Browser callers are expected to be local tooling only.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list([
            HeaderValue::from_static("http://localhost"),
            HeaderValue::from_static("http://127.0.0.1"),
        ]))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    Router::new()
        .route("/tree/:chunk_id", get(handlers::tree::get_tree))
        .route("/peers", get(handlers::tree::get_peers))
        .route("/health", get(handlers::tree::health))
        .route("/metrics", get(crate::metrics::metrics_handler))
        .route("/relayer/submit", post(handlers::relayer::submit))
        .route("/relayer/status", get(handlers::relayer::status))
        .with_state(state)
        // The handler enforces the 1 MiB relayer cap with a JSON error; this
        // outer limit just stops hostile bodies from buffering unbounded.
        .layer(DefaultBodyLimit::max(MAX_SUBMIT_BODY_BYTES * 2))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
