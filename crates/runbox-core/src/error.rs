//! Error types for runbox-core.

use thiserror::Error;

/// Result type for runbox-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in runbox-core.
///
/// Execution failures of user code are never errors: they travel as
/// [`Outcome::Failure`](crate::execute::Outcome::Failure) values.
#[derive(Debug, Error)]
pub enum Error {
    /// IPC communication error with a worker process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The current worker has not acknowledged init yet (or never will).
    #[error("worker is not ready")]
    WorkerNotReady,

    /// The worker handle was already terminated.
    #[error("worker has been terminated")]
    WorkerTerminated,

    /// The runtime could not be loaded by the worker, or the worker died
    /// before acknowledging init.
    #[error("initialization failed: {0}")]
    Initialization(String),
}

impl Error {
    /// Render the error together with a recovery hint, if one applies.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Error::Ipc(msg) if msg.contains("runbox-worker") => {
                Some("build the worker with `cargo build -p runbox-worker` or set RUNBOX_WORKER_PATH")
            }
            Error::Initialization(_) => {
                Some("check that --runtime names an interpreter available on this machine")
            }
            Error::WorkerNotReady => Some("wait for the worker to report ready before running"),
            _ => None,
        };

        match hint {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
