//! IPC protocol messages for runbox worker processes.
//!
//! Uses length-prefixed JSON envelopes over stdin/stdout.
//! Format: 4-byte length (u32 LE) + JSON body `{"method": .., "payload": ..}`.

use std::io::{ErrorKind, Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Frames larger than this are rejected (100MB).
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Untyped wire envelope shared by both directions.
///
/// Kept separate from the typed messages so that unknown methods can be
/// logged and skipped instead of failing the whole stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Envelope {
    pub fn new(method: impl Into<String>, payload: Value) -> Self {
        Self {
            method: method.into(),
            payload,
        }
    }
}

/// Request sent from the controller to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerRequest {
    /// Load the runtime found at `location`.
    Init { location: String },

    /// Execute source text with the loaded runtime.
    Run { source: String },
}

impl WorkerRequest {
    pub fn method(&self) -> &'static str {
        match self {
            WorkerRequest::Init { .. } => "init",
            WorkerRequest::Run { .. } => "run",
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        match self {
            WorkerRequest::Init { location } => {
                Envelope::new("init", Value::String(location.clone()))
            }
            WorkerRequest::Run { source } => Envelope::new("run", Value::String(source.clone())),
        }
    }

    /// Interpret an envelope received by a worker.
    ///
    /// Returns `None` for unknown methods or payloads of the wrong shape.
    pub fn from_envelope(envelope: Envelope) -> Option<Self> {
        match (envelope.method.as_str(), envelope.payload) {
            ("init", Value::String(location)) => Some(WorkerRequest::Init { location }),
            ("run", Value::String(source)) => Some(WorkerRequest::Run { source }),
            ("run", Value::Null) => Some(WorkerRequest::Run {
                source: String::new(),
            }),
            _ => None,
        }
    }
}

/// Which one-shot listener a reply is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    Init,
    Result,
}

/// Reply sent from a worker to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReply {
    /// Init acknowledgement. `error` is set when the runtime failed to load.
    Init { error: Option<String> },

    /// Raw execution outcome, still to be decoded by the `ResultDecoder`.
    Result { payload: String },
}

impl WorkerReply {
    pub fn kind(&self) -> ReplyKind {
        match self {
            WorkerReply::Init { .. } => ReplyKind::Init,
            WorkerReply::Result { .. } => ReplyKind::Result,
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        match self {
            WorkerReply::Init { error: None } => Envelope::new("init", Value::Null),
            WorkerReply::Init { error: Some(error) } => {
                Envelope::new("init", serde_json::json!({ "error": error }))
            }
            WorkerReply::Result { payload } => {
                Envelope::new("result", Value::String(payload.clone()))
            }
        }
    }

    /// Interpret an envelope received by the controller.
    ///
    /// A `result` payload that is not a string is kept as its JSON text so
    /// the decoder still gets to judge it. Returns `None` for unknown methods.
    pub fn from_envelope(envelope: Envelope) -> Option<Self> {
        match envelope.method.as_str() {
            "init" => {
                let error = match envelope.payload {
                    Value::Null => None,
                    Value::Object(mut map) => match map.remove("error") {
                        None | Some(Value::Null) => None,
                        Some(Value::String(s)) => Some(s),
                        Some(other) => Some(other.to_string()),
                    },
                    other => Some(format!("unexpected init acknowledgement: {}", other)),
                };
                Some(WorkerReply::Init { error })
            }
            "result" => {
                let payload = match envelope.payload {
                    Value::String(s) => s,
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                Some(WorkerReply::Result { payload })
            }
            _ => None,
        }
    }
}

/// Encode an envelope as a JSON body.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    serde_json::to_vec(envelope)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))
}

/// Decode a JSON body into an envelope.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::Serialization(format!("Failed to decode IPC message: {}", e)))
}

fn check_len(len: usize) -> Result<()> {
    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }
    Ok(())
}

/// Write an envelope to a writer using length-prefixed encoding.
pub fn write_message<W: Write>(writer: &mut W, envelope: &Envelope) -> Result<()> {
    let bytes = encode_envelope(envelope)?;
    check_len(bytes.len())?;

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read one frame body from a reader.
///
/// Returns `Ok(None)` when the stream ends before a new frame starts.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Ipc(format!("Failed to read IPC message length: {}", e))),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    check_len(len)?;

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    Ok(Some(bytes))
}

/// Read and decode one envelope. `Ok(None)` means clean end of stream.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<Envelope>> {
    match read_frame(reader)? {
        Some(bytes) => decode_envelope(&bytes).map(Some),
        None => Ok(None),
    }
}

/// Async counterpart of [`write_message`], used by the controller side.
pub async fn write_message_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<()> {
    let bytes = encode_envelope(envelope)?;
    check_len(bytes.len())?;

    writer
        .write_u32_le(bytes.len() as u32)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Async counterpart of [`read_frame`].
pub async fn read_frame_async<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let len = match reader.read_u32_le().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Ipc(format!("Failed to read IPC message length: {}", e))),
    };
    check_len(len)?;

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    Ok(Some(bytes))
}
