use thiserror::Error;

pub type Result<T> = std::result::Result<T, TetherErr>;

/// Errors that cross component boundaries.
///
/// `RequestCancelled` is the distinguished cancellation sentinel: it is
/// produced when a request context is cancelled (user-initiated or timeout)
/// and must never be logged at error level.
#[derive(Debug, Error)]
pub enum TetherErr {
    #[error("request cancelled")]
    RequestCancelled,

    #[error("stream disconnected before completion: {0}")]
    Stream(String),

    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(reqwest::StatusCode, String),

    #[error("no model selected in config")]
    NoModelSelected,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TetherErr {
    /// Whether this error is the cancellation sentinel.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TetherErr::RequestCancelled)
    }
}
