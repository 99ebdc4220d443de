//! Error types for runbox server.

/// Server error type.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(String),

    /// Runbox core error.
    #[error("Core error: {0}")]
    Core(#[from] runbox_core::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A run was requested while another one is outstanding.
    #[error("Execution already in progress")]
    ExecutionInProgress,

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
