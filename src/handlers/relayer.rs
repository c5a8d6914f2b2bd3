//! Relayer submission surface: `/relayer/submit`, `/relayer/status`.
//!
//! Preconditions run in a fixed order: body size, per-IP rate limit,
//! structural validation, then the queue. The delay between acceptance and
//! chain submission is the whole point; the handler never touches the chain.

use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::Json as AxumJson;
use serde::Deserialize;

use crate::chain::ProofBundle;
use crate::constants::{MAX_CHUNK_ID, MAX_SUBMIT_BODY_BYTES, MAX_WITHDRAW_AMOUNT};
use crate::constants::{MAX_PUBKEY_B58_LEN, MIN_PUBKEY_B58_LEN};
use crate::error::{AgentError, AgentResult};
use crate::metrics::metrics;
use crate::state::AppState;
use crate::utils::now_ms;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub proof: ProofBundle,
    pub recipient: String,
    pub amount: u64,
    #[serde(rename = "chunkId", alias = "chunk_id")]
    pub chunk_id: u32,
}

impl SubmitRequest {
    fn validate(&self) -> Result<(), AgentError> {
        // Proof shape: the serde parse already demanded pi_a/pi_b/pi_c/
        // protocol/curve; check what it could not.
        if self.proof.proof.protocol != "groth16" || self.proof.proof.curve != "bn128" {
            return Err(AgentError::BadInput(
                "proof must be groth16 over bn128".to_string(),
            ));
        }
        if self.proof.proof.pi_a.len() < 2
            || self.proof.proof.pi_b.len() < 2
            || self.proof.proof.pi_c.len() < 2
        {
            return Err(AgentError::BadInput("malformed proof points".to_string()));
        }
        // The processor derives the nullifier hash from the public signals;
        // refuse anything it would choke on later.
        self.proof
            .nullifier_hash()
            .map_err(|_| AgentError::BadInput("proof public signals are invalid".to_string()))?;

        let recipient = self.recipient.trim();
        if !(MIN_PUBKEY_B58_LEN..=MAX_PUBKEY_B58_LEN).contains(&recipient.len()) {
            return Err(AgentError::BadInput(format!(
                "recipient must be {MIN_PUBKEY_B58_LEN}-{MAX_PUBKEY_B58_LEN} base58 chars"
            )));
        }
        if bs58::decode(recipient).into_vec().is_err() {
            return Err(AgentError::BadInput("recipient is not base58".to_string()));
        }
        if self.amount == 0 || self.amount > MAX_WITHDRAW_AMOUNT {
            return Err(AgentError::BadInput(format!(
                "amount must be in 1..={MAX_WITHDRAW_AMOUNT}"
            )));
        }
        if self.chunk_id > MAX_CHUNK_ID {
            return Err(AgentError::BadInput(format!(
                "chunkId must be <= {MAX_CHUNK_ID}"
            )));
        }
        Ok(())
    }
}

pub async fn submit(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<std::net::SocketAddr>,
    body: axum::body::Bytes,
) -> AgentResult<AxumJson<serde_json::Value>> {
    if body.len() > MAX_SUBMIT_BODY_BYTES {
        metrics().relay_rejected_total.inc();
        return Err(AgentError::Capacity(format!(
            "body exceeds {MAX_SUBMIT_BODY_BYTES} bytes"
        )));
    }
    {
        let mut limiter = state.rate_limiter.lock().expect("rate limiter lock");
        if let Err(e) = limiter.check(peer.ip(), now_ms()) {
            metrics().relay_rejected_total.inc();
            return Err(e);
        }
    }
    let req: SubmitRequest = serde_json::from_slice(&body)
        .map_err(|e| AgentError::BadInput(format!("invalid submit body: {e}")))?;
    if let Err(e) = req.validate() {
        metrics().relay_rejected_total.inc();
        return Err(e);
    }

    let (queue_id, execute_at) =
        state
            .queue
            .push(req.proof, req.recipient.trim().to_string(), req.amount, req.chunk_id);
    metrics().relay_accepted_total.inc();
    metrics().queue_length.set(state.queue.len() as i64);

    Ok(AxumJson(serde_json::json!({
        "success": true,
        "queueId": queue_id,
        "estimatedExecutionTime": execute_at as u64,
    })))
}

pub async fn status(
    State(state): State<Arc<AppState>>,
) -> AgentResult<AxumJson<serde_json::Value>> {
    Ok(AxumJson(serde_json::json!({
        "queueLength": state.queue.len(),
        "processing": state.queue.is_processing(),
        "fee": state.fee,
        "maxDelay": state.queue.max_delay_ms(),
    })))
}
