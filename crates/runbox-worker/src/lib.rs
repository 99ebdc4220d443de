//! Runbox worker: the isolated process that actually executes source text.
//!
//! The worker reads framed requests from its controller, loads a runtime on
//! `init`, and answers every `run` with one `result`. Requests are handled
//! strictly one at a time, so a run that never finishes blocks the worker
//! until the controller kills it.

pub mod runtime;

use std::io::{Read, Write};

use runbox_core::ipc::{WorkerReply, WorkerRequest, read_message, write_message};
use runbox_core::{Error, Result};

pub use runtime::{
    CommandLoader, CommandRuntime, ExecutionError, ExecutionRuntime, RuntimeError, RuntimeLoader,
    encode_outcome,
};

/// Error reported for `run` requests that arrive before a runtime is loaded.
pub const NOT_INITIALIZED: &str = "runtime not initialized";

/// Worker-side request handler.
pub struct Worker<L> {
    loader: L,
    runtime: Option<Box<dyn ExecutionRuntime>>,
}

impl<L: RuntimeLoader> Worker<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            runtime: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.runtime.is_some()
    }

    /// Answer one request.
    pub fn handle(&mut self, request: WorkerRequest) -> WorkerReply {
        match request {
            WorkerRequest::Init { location } => match self.loader.load(&location) {
                Ok(runtime) => {
                    self.runtime = Some(runtime);
                    WorkerReply::Init { error: None }
                }
                Err(e) => {
                    tracing::error!("Failed to load runtime '{}': {}", location, e);
                    WorkerReply::Init {
                        error: Some(e.to_string()),
                    }
                }
            },
            WorkerRequest::Run { source } => {
                let result = match self.runtime.as_mut() {
                    Some(runtime) => runtime.execute_source(&source),
                    None => Err(ExecutionError(NOT_INITIALIZED.to_string())),
                };
                WorkerReply::Result {
                    payload: encode_outcome(&result),
                }
            }
        }
    }

    /// Serve requests until the controller closes the stream.
    ///
    /// Undecodable frames and unknown methods are logged and skipped.
    pub fn serve<R: Read, W: Write>(&mut self, reader: &mut R, writer: &mut W) -> Result<()> {
        loop {
            let envelope = match read_message(reader) {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    tracing::debug!("controller closed the request stream");
                    return Ok(());
                }
                Err(Error::Serialization(msg)) => {
                    tracing::warn!("Skipping malformed request: {}", msg);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let method = envelope.method.clone();
            let Some(request) = WorkerRequest::from_envelope(envelope) else {
                tracing::warn!("Ignoring request with unknown method '{}'", method);
                continue;
            };

            tracing::debug!("handling {}", method);
            let reply = self.handle(request);
            write_message(writer, &reply.to_envelope())?;
        }
    }
}

/// Run the worker's message loop with a fresh [`Worker`]. Returns on EOF.
pub fn serve<R: Read, W: Write, L: RuntimeLoader>(
    reader: &mut R,
    writer: &mut W,
    loader: L,
) -> Result<()> {
    Worker::new(loader).serve(reader, writer)
}
