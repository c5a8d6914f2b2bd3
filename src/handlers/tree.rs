//! Tree-sharing endpoints: `/tree/{chunk}`, `/peers`, `/health`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json as AxumJson;

use crate::error::{AgentError, AgentResult};
use crate::state::AppState;
use crate::utils::now_ms;

pub async fn get_tree(
    State(state): State<Arc<AppState>>,
    Path(chunk_id): Path<u32>,
) -> AgentResult<AxumJson<serde_json::Value>> {
    let snapshot = state
        .engine
        .snapshot(chunk_id)
        .ok_or_else(|| AgentError::NotFound("Tree not found".to_string()))?;
    Ok(AxumJson(serde_json::json!({
        "chunkId": snapshot.chunk_id,
        "leaves": snapshot.leaves,
        "tree": snapshot.tree,
        "root": snapshot.root,
        "leafCount": snapshot.leaf_count,
    })))
}

pub async fn get_peers(
    State(state): State<Arc<AppState>>,
) -> AgentResult<AxumJson<serde_json::Value>> {
    let peers: Vec<serde_json::Value> = state
        .peers
        .all()
        .into_iter()
        .map(|p| {
            let mut trees: Vec<u32> = p.trees.iter().copied().collect();
            trees.sort_unstable();
            serde_json::json!({
                "host": p.host,
                "port": p.port,
                "lastSeen": p.last_seen as u64,
                "trees": trees,
            })
        })
        .collect();
    let count = peers.len();
    Ok(AxumJson(serde_json::json!({ "peers": peers, "count": count })))
}

pub async fn health(
    State(state): State<Arc<AppState>>,
) -> AgentResult<AxumJson<serde_json::Value>> {
    Ok(AxumJson(serde_json::json!({
        "status": "ok",
        "chunks": state.engine.chunks(),
        "port": state.http_port,
        "timestamp": now_ms() as u64,
    })))
}
