use axum::response::IntoResponse;
use axum::Json as AxumJson;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Bad input: {0}")]
    BadInput(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Network: {0}")]
    Network(String),
    #[error("Disk: {0}")]
    Disk(String),
    #[error("Chain unavailable: {0}")]
    ChainUnavailable(String),
    #[error("Chain rejected: {0}")]
    ChainRejected(String),
    #[error("Capacity: {0}")]
    Capacity(String),
    #[error("Too many requests: {0}")]
    RateLimited(String),
    #[error("Integrity: {0}")]
    Integrity(String),
}

impl IntoResponse for AgentError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        // Internal kinds collapse to 500 with no details beyond the message;
        // never leak stack traces or chain internals to HTTP callers.
        let (status, msg) = match self {
            AgentError::BadInput(m) => (StatusCode::BAD_REQUEST, m),
            AgentError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            AgentError::Capacity(m) => (StatusCode::PAYLOAD_TOO_LARGE, m),
            AgentError::RateLimited(m) => (StatusCode::TOO_MANY_REQUESTS, m),
            AgentError::Conflict(m)
            | AgentError::Timeout(m)
            | AgentError::Network(m)
            | AgentError::Disk(m)
            | AgentError::ChainUnavailable(m)
            | AgentError::ChainRejected(m)
            | AgentError::Integrity(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        let body = serde_json::json!({ "error": msg });
        (status, AxumJson(body)).into_response()
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => AgentError::Timeout(e.to_string()),
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe => AgentError::Network(e.to_string()),
            _ => AgentError::Disk(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Integrity(format!("json: {e}"))
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
