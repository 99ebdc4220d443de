//! Worker process management for runbox execution.
//!
//! Provides `WorkerHandle` for the spawn/send/terminate lifecycle of one
//! worker, the `WorkerLauncher`/`WorkerTransport` seam it is built on, and
//! `ProcessLauncher`, which runs each worker as an isolated child process.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::execute::ScopeToken;

use super::protocol::{
    WorkerReply, WorkerRequest, decode_envelope, read_frame_async, write_message_async,
};

/// Environment variable that overrides worker binary discovery.
pub const WORKER_PATH_ENV: &str = "RUNBOX_WORKER_PATH";

const WORKER_BINARY: &str = if cfg!(windows) {
    "runbox-worker.exe"
} else {
    "runbox-worker"
};

/// Identifies one worker instance of a broker. Incremented on every respawn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Something a worker delivered to its broker, stamped with its generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEvent {
    pub generation: Generation,
    pub kind: WorkerEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEventKind {
    /// A decoded protocol reply.
    Reply(WorkerReply),

    /// The worker stopped producing output (process exit or broken pipe).
    Exited { reason: String },
}

/// Receiving end of a broker's worker events.
pub type WorkerEvents = mpsc::UnboundedReceiver<WorkerEvent>;

/// Delivery channel handed to one worker generation.
///
/// Every event is stamped with the sink's generation, and nothing is
/// forwarded once the owning scope's token has been invalidated.
#[derive(Clone)]
pub struct EventSink {
    generation: Generation,
    token: ScopeToken,
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl EventSink {
    pub fn new(
        generation: Generation,
        token: ScopeToken,
        tx: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            generation,
            token,
            tx,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Whether events sent now could still reach the broker.
    pub fn is_open(&self) -> bool {
        self.token.is_valid() && !self.tx.is_closed()
    }

    /// Forward a reply. Returns `false` once the sink is closed for good.
    pub fn deliver(&self, reply: WorkerReply) -> bool {
        self.emit(WorkerEventKind::Reply(reply))
    }

    /// Report that the worker went away.
    pub fn exited(&self, reason: impl Into<String>) -> bool {
        self.emit(WorkerEventKind::Exited {
            reason: reason.into(),
        })
    }

    fn emit(&self, kind: WorkerEventKind) -> bool {
        if !self.token.is_valid() {
            tracing::debug!(generation = %self.generation, "scope invalidated, dropping worker event");
            return false;
        }
        self.tx
            .send(WorkerEvent {
                generation: self.generation,
                kind,
            })
            .is_ok()
    }
}

/// Message path to one running worker.
pub trait WorkerTransport: Send {
    /// Post a request. Never waits for the worker.
    fn post(&mut self, request: WorkerRequest) -> Result<()>;

    /// Kill the worker. Must be idempotent.
    fn terminate(&mut self);

    /// OS-level identifier, if there is one.
    fn id(&self) -> Option<u32> {
        None
    }
}

/// Starts workers whose replies flow into the given sink.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, sink: EventSink) -> Result<Box<dyn WorkerTransport>>;
}

/// Handle to one worker generation.
///
/// Readiness is only set once the broker has seen the init acknowledgement.
/// Dropping the handle terminates the worker.
pub struct WorkerHandle {
    generation: Generation,
    transport: Box<dyn WorkerTransport>,
    ready: bool,
    terminated: bool,
}

impl WorkerHandle {
    /// Start a worker and post its init request. Returns without waiting
    /// for the acknowledgement.
    pub fn spawn(launcher: &dyn WorkerLauncher, location: &str, sink: EventSink) -> Result<Self> {
        let generation = sink.generation();
        let transport = launcher.launch(sink)?;

        let mut handle = Self {
            generation,
            transport,
            ready: false,
            terminated: false,
        };
        handle.send(WorkerRequest::Init {
            location: location.to_string(),
        })?;

        tracing::debug!(%generation, pid = ?handle.id(), "spawned worker");
        Ok(handle)
    }

    /// Post a request. Callers must gate `run` requests on [`is_ready`](Self::is_ready).
    pub fn send(&mut self, request: WorkerRequest) -> Result<()> {
        if self.terminated {
            return Err(Error::WorkerTerminated);
        }
        tracing::debug!(generation = %self.generation, method = request.method(), "posting request");
        self.transport.post(request)
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_ready(&self) -> bool {
        self.ready && !self.terminated
    }

    pub fn mark_ready(&mut self) {
        if !self.terminated {
            self.ready = true;
        }
    }

    pub fn id(&self) -> Option<u32> {
        self.transport.id()
    }

    /// Kill the worker. Replies it already queued are never delivered
    /// because the owning scope is invalidated before this is called.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.ready = false;
        self.transport.terminate();
        tracing::debug!(generation = %self.generation, "terminated worker");
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Launches `runbox-worker` child processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    worker_path: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(worker_path: impl Into<PathBuf>) -> Self {
        Self {
            worker_path: worker_path.into(),
            args: Vec::new(),
        }
    }

    /// Arguments passed to every worker, e.g. the subcommand of a
    /// multi-purpose binary that serves the worker protocol.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Use the binary found by [`find_worker_binary`].
    pub fn discover() -> Result<Self> {
        Ok(Self::new(find_worker_binary()?))
    }

    pub fn worker_path(&self) -> &Path {
        &self.worker_path
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, sink: EventSink) -> Result<Box<dyn WorkerTransport>> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::Ipc("worker processes must be launched inside a Tokio runtime".to_string())
        })?;

        let mut std_command = std::process::Command::new(&self.worker_path);
        std_command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()); // Let worker stderr pass through for debugging

        // Own process group so terminate also reaches runtime grandchildren.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_command.process_group(0);
        }

        let mut command = Command::from(std_command);
        command.kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            Error::Ipc(format!(
                "Failed to spawn worker process '{}': {}",
                self.worker_path.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdout".to_string()))?;

        let generation = sink.generation();
        let (requests, queue) = mpsc::unbounded_channel();
        let writer = runtime.spawn(write_loop(stdin, queue, generation));
        let reader = runtime.spawn(read_loop(stdout, sink));

        Ok(Box::new(ProcessTransport {
            pid: child.id(),
            child,
            requests,
            reader,
            writer,
            terminated: false,
        }))
    }
}

struct ProcessTransport {
    child: Child,
    pid: Option<u32>,
    requests: mpsc::UnboundedSender<WorkerRequest>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    terminated: bool,
}

impl WorkerTransport for ProcessTransport {
    fn post(&mut self, request: WorkerRequest) -> Result<()> {
        if self.terminated {
            return Err(Error::WorkerTerminated);
        }
        self.requests
            .send(request)
            .map_err(|_| Error::Ipc("worker request queue is closed".to_string()))
    }

    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                // SAFETY: signals the process group we created for this child.
                unsafe {
                    libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
                }
            }
        }

        // Already-exited children report InvalidInput, which is fine.
        if let Err(e) = self.child.start_kill() {
            if e.kind() != ErrorKind::InvalidInput {
                tracing::warn!("Failed to kill worker: {}", e);
            }
        }

        self.reader.abort();
        self.writer.abort();
    }

    fn id(&self) -> Option<u32> {
        self.pid
    }
}

async fn write_loop(
    mut stdin: ChildStdin,
    mut queue: mpsc::UnboundedReceiver<WorkerRequest>,
    generation: Generation,
) {
    while let Some(request) = queue.recv().await {
        if let Err(e) = write_message_async(&mut stdin, &request.to_envelope()).await {
            tracing::warn!(%generation, "Failed to post {} request: {}", request.method(), e);
            break;
        }
    }
}

async fn read_loop(stdout: ChildStdout, sink: EventSink) {
    let generation = sink.generation();
    let mut stdout = BufReader::new(stdout);

    let reason = loop {
        if !sink.is_open() {
            tracing::debug!(%generation, "sink closed, reader stopping");
            return;
        }

        let frame = match read_frame_async(&mut stdout).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break "worker closed its output".to_string(),
            Err(e) => break e.to_string(),
        };

        let envelope = match decode_envelope(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(%generation, "Ignoring malformed worker message: {}", e);
                continue;
            }
        };

        let method = envelope.method.clone();
        match WorkerReply::from_envelope(envelope) {
            Some(reply) => {
                if !sink.deliver(reply) {
                    return;
                }
            }
            None => {
                tracing::warn!(%generation, "Ignoring worker message with unknown method '{}'", method)
            }
        }
    };

    sink.exited(reason);
}

/// Find the runbox-worker binary path.
///
/// Looks in the following order:
/// 1. `RUNBOX_WORKER_PATH` environment variable
/// 2. Same directory as the current executable
/// 3. System PATH
/// 4. `target/{debug,release}` of this workspace (development)
pub fn find_worker_binary() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!("{} points at missing file {}", WORKER_PATH_ENV, path.display());
    }

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let worker_path = exe_dir.join(WORKER_BINARY);
            if worker_path.exists() {
                return Ok(worker_path);
            }
        }
    }

    if let Ok(path) = which::which(WORKER_BINARY) {
        return Ok(path);
    }

    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        for profile in &["debug", "release"] {
            let path = PathBuf::from(&manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(WORKER_BINARY);
            if path.exists() {
                return Ok(path.canonicalize().unwrap_or(path));
            }
        }
    }

    Err(Error::Ipc(format!(
        "Could not find {} binary. Set {} or ensure it's in PATH.",
        WORKER_BINARY, WORKER_PATH_ENV
    )))
}
