//! Error types for the auxiliary RPC channel.

/// Errors produced by the miIO channel.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device did not answer in time")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("device error {code}: {message}")]
    Device { code: i64, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid token: {0}")]
    Token(String),
}
