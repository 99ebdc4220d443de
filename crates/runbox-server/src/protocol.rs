//! WebSocket protocol messages for runbox server.
//!
//! Defines the message types exchanged between a playground UI and the
//! server. Both directions are JSON objects tagged by `type`.

use runbox_core::{BrokerNotice, Outcome};
use serde::{Deserialize, Serialize};

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Execute source text. Only accepted while the session is idle.
    Run {
        /// Source text handed to the runtime.
        code: String,
    },

    /// Abort the outstanding run. Ignored when nothing is running.
    Cancel,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The worker became ready or stopped being ready.
    ReadyChanged { ready: bool },

    /// A run request was accepted.
    Running,

    /// A run attempt finished.
    Outcome { outcome: Outcome },

    /// The worker can never become ready.
    InitFailed { message: String },

    /// A client request was rejected.
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

impl From<BrokerNotice> for ServerMessage {
    fn from(notice: BrokerNotice) -> Self {
        match notice {
            BrokerNotice::ReadyChanged(ready) => Self::ReadyChanged { ready },
            BrokerNotice::Outcome(outcome) => Self::Outcome { outcome },
            BrokerNotice::InitFailed(message) => Self::InitFailed { message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_conversion() {
        assert_eq!(
            ServerMessage::from(BrokerNotice::ReadyChanged(true)),
            ServerMessage::ReadyChanged { ready: true }
        );
        assert_eq!(
            ServerMessage::from(BrokerNotice::Outcome(Outcome::Cancelled)),
            ServerMessage::Outcome {
                outcome: Outcome::Cancelled
            }
        );
        assert_eq!(
            ServerMessage::from(BrokerNotice::InitFailed("gone".to_string())),
            ServerMessage::InitFailed {
                message: "gone".to_string()
            }
        );
    }
}
