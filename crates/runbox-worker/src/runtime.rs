//! Execution runtimes hosted by the worker.
//!
//! The broker never looks inside a runtime. The worker loads one on `init`
//! and calls it synchronously for every `run`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Serialize;
use thiserror::Error;

/// Failure to load a runtime. Permanent for the worker that hit it.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime location is empty")]
    EmptyLocation,

    #[error("runtime '{location}' not found: {reason}")]
    NotFound { location: String, reason: String },
}

/// Error raised by executed source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ExecutionError(pub String);

/// A loaded runtime: one synchronous execute capability.
pub trait ExecutionRuntime {
    /// Run `source` and return everything it printed.
    fn execute_source(&mut self, source: &str) -> Result<String, ExecutionError>;
}

/// Resolves a runtime asset location into a runtime.
pub trait RuntimeLoader {
    fn load(&self, location: &str) -> Result<Box<dyn ExecutionRuntime>, RuntimeError>;
}

/// Runs an interpreter program per execution, feeding the source on stdin.
///
/// Stdout becomes the output buffer. A non-zero exit becomes an error whose
/// message is the interpreter's stderr.
#[derive(Debug, Clone)]
pub struct CommandRuntime {
    program: PathBuf,
}

impl CommandRuntime {
    /// Resolve `location` as a path or a program name on `PATH`.
    pub fn resolve(location: &str) -> Result<Self, RuntimeError> {
        let location = location.trim();
        if location.is_empty() {
            return Err(RuntimeError::EmptyLocation);
        }

        let program = which::which(location).map_err(|e| RuntimeError::NotFound {
            location: location.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { program })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl ExecutionRuntime for CommandRuntime {
    fn execute_source(&mut self, source: &str) -> Result<String, ExecutionError> {
        let mut child = Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ExecutionError(format!("failed to start {}: {}", self.program.display(), e))
            })?;

        // Feed stdin from a separate thread so a chatty interpreter cannot
        // deadlock against a full stdout pipe.
        let feeder = child.stdin.take().map(|mut stdin| {
            let source = source.to_owned();
            std::thread::spawn(move || {
                if let Err(e) = stdin.write_all(source.as_bytes()) {
                    tracing::debug!("interpreter stopped reading source: {}", e);
                }
            })
        });

        let output = child
            .wait_with_output()
            .map_err(|e| ExecutionError(format!("failed to wait for interpreter: {}", e)))?;
        if let Some(feeder) = feeder {
            let _ = feeder.join();
        }

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.is_empty() {
            Err(ExecutionError(format!("interpreter exited with {}", output.status)))
        } else {
            Err(ExecutionError(stderr))
        }
    }
}

/// Loads a [`CommandRuntime`] for every location.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandLoader;

impl RuntimeLoader for CommandLoader {
    fn load(&self, location: &str) -> Result<Box<dyn ExecutionRuntime>, RuntimeError> {
        let runtime = CommandRuntime::resolve(location)?;
        tracing::info!("loaded runtime {}", runtime.program().display());
        Ok(Box::new(runtime))
    }
}

#[derive(Serialize)]
struct RawOutcome {
    #[serde(skip_serializing_if = "String::is_empty")]
    buffer: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    error: String,
}

/// Render an execution result as the raw outcome text sent to the broker.
///
/// Empty fields are omitted, so a silent success encodes as `{}`.
pub fn encode_outcome(result: &Result<String, ExecutionError>) -> String {
    let raw = match result {
        Ok(buffer) => RawOutcome {
            buffer: buffer.clone(),
            error: String::new(),
        },
        Err(ExecutionError(message)) => RawOutcome {
            buffer: String::new(),
            error: if message.is_empty() {
                "execution failed".to_string()
            } else {
                message.clone()
            },
        },
    };
    serde_json::to_string(&raw).unwrap_or_else(|_| "{}".to_string())
}
