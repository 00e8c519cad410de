use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OvsdbError>;

#[derive(Error, Debug)]
pub enum OvsdbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid database address: {0}")]
    InvalidAddress(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Operation {index} failed: {error}{}", details.as_deref().map(|d| format!(" ({})", d)).unwrap_or_default())]
    Transaction {
        index: usize,
        error: String,
        details: Option<String>,
    },

    #[error("Unexpected reply: {0}")]
    Decode(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    Disconnected,
}

impl OvsdbError {
    /// Whether the connection is unusable and must be re-established
    pub fn is_connection_error(&self) -> bool {
        matches!(self, OvsdbError::Io(_) | OvsdbError::Disconnected | OvsdbError::Timeout(_))
    }
}
