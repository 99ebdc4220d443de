//! Decoding of raw worker payloads into outcomes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Output reported when a run succeeded without producing anything.
pub const EMPTY_OUTPUT: &str = "<no output>";

/// Message reported when a payload is not structured data at all.
pub const GENERIC_FAILURE: &str = "Script execution error";

/// Result of one run attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { output: String },
    Failure { message: String },
    Cancelled,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

/// Turns raw worker payloads into [`Outcome`]s. Never fails.
pub struct ResultDecoder;

impl ResultDecoder {
    /// Rules, in order: `error` field → Failure, `buffer` field → Success,
    /// neither → Success with [`EMPTY_OUTPUT`]. Anything that is not a JSON
    /// object → Failure with [`GENERIC_FAILURE`].
    pub fn decode(raw: &[u8]) -> Outcome {
        let mut fields = match serde_json::from_slice::<Value>(raw) {
            Ok(Value::Object(fields)) => fields,
            Ok(other) => {
                tracing::warn!("Worker result is not an object: {}", other);
                return Self::generic_failure();
            }
            Err(e) => {
                tracing::warn!("Failed to parse worker result: {}", e);
                return Self::generic_failure();
            }
        };

        if let Some(error) = fields.remove("error") {
            return Outcome::Failure {
                message: field_text(error),
            };
        }
        if let Some(buffer) = fields.remove("buffer") {
            return Outcome::Success {
                output: field_text(buffer),
            };
        }
        Outcome::Success {
            output: EMPTY_OUTPUT.to_string(),
        }
    }

    fn generic_failure() -> Outcome {
        Outcome::Failure {
            message: GENERIC_FAILURE.to_string(),
        }
    }
}

fn field_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
