//! Execution broker: the run/cancel state machine.
//!
//! The broker owns exactly one worker and one cancellation scope at a time.
//! Cancellation is hard: the worker is killed and replaced, never asked to
//! stop, because executed code may never yield.

use std::path::PathBuf;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::ipc::{
    EventSink, Generation, ProcessLauncher, ReplyKind, WorkerEvent, WorkerEventKind,
    WorkerEvents, WorkerHandle, WorkerLauncher, WorkerReply, WorkerRequest,
};

use super::context::ExecutionCallback;
use super::decoder::{Outcome, ResultDecoder};
use super::scope::CancellationScope;

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Runtime asset location passed to every worker's init request.
    pub runtime_location: String,
    /// Worker binary. Discovered with `find_worker_binary` when unset.
    pub worker_path: Option<PathBuf>,
    /// Arguments the worker binary is started with.
    pub worker_args: Vec<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            runtime_location: "sh".to_string(),
            worker_path: None,
            worker_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// No run outstanding. The worker may or may not be ready.
    Idle,
    /// First worker has not acknowledged init yet.
    AwaitingReady,
    /// One run request outstanding.
    Running,
}

/// Orchestrates one worker across the `Idle`/`AwaitingReady`/`Running` states.
///
/// The broker is driven one event at a time by a single owner: calls to
/// [`run`](Self::run) and [`cancel`](Self::cancel), and worker events fed to
/// [`handle_event`](Self::handle_event) from the receiver returned by
/// [`new`](Self::new).
pub struct ExecutionBroker {
    runtime_location: String,
    launcher: Box<dyn WorkerLauncher>,
    callback: Box<dyn ExecutionCallback>,
    generation: Generation,
    state: BrokerState,
    worker: Option<WorkerHandle>,
    scope: CancellationScope<ExecutionBroker>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    run_started: Option<Instant>,
    closed: bool,
}

impl ExecutionBroker {
    /// Create a broker and spawn its first worker.
    ///
    /// Returns immediately in `AwaitingReady`. The caller owns the event
    /// receiver and must feed every event back through `handle_event`.
    pub fn new(
        runtime_location: impl Into<String>,
        launcher: impl WorkerLauncher + 'static,
        callback: impl ExecutionCallback + 'static,
    ) -> (Self, WorkerEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let generation = Generation::default();

        let mut broker = Self {
            runtime_location: runtime_location.into(),
            launcher: Box::new(launcher),
            callback: Box::new(callback),
            generation,
            state: BrokerState::AwaitingReady,
            worker: None,
            scope: CancellationScope::create(generation),
            events,
            run_started: None,
            closed: false,
        };
        broker.spawn_worker();

        (broker, rx)
    }

    /// Create a broker backed by worker processes.
    pub fn with_config(
        config: &BrokerConfig,
        callback: impl ExecutionCallback + 'static,
    ) -> Result<(Self, WorkerEvents)> {
        let launcher = match &config.worker_path {
            Some(path) => ProcessLauncher::new(path).with_args(config.worker_args.iter().cloned()),
            None => ProcessLauncher::discover()?,
        };
        tracing::info!(
            worker = %launcher.worker_path().display(),
            runtime = %config.runtime_location,
            "starting execution broker"
        );
        Ok(Self::new(config.runtime_location.clone(), launcher, callback))
    }

    pub fn state(&self) -> BrokerState {
        self.state
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_ready(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| w.is_ready())
    }

    /// OS identifier of the current worker, if it has one.
    pub fn worker_id(&self) -> Option<u32> {
        self.worker.as_ref().and_then(|w| w.id())
    }

    /// Submit source text. Only valid while `Idle`.
    ///
    /// Rejected without any state change when the worker is not ready.
    pub fn run(&mut self, code: impl Into<String>) -> Result<()> {
        if self.closed {
            return Err(Error::WorkerTerminated);
        }
        let worker = match self.worker.as_mut() {
            Some(worker) if worker.is_ready() => worker,
            _ => {
                tracing::debug!(generation = %self.generation, "run rejected, worker not ready");
                return Err(Error::WorkerNotReady);
            }
        };

        worker.send(WorkerRequest::Run {
            source: code.into(),
        })?;

        self.state = BrokerState::Running;
        self.run_started = Some(Instant::now());
        self.scope
            .listen(ReplyKind::Result, |broker: &mut Self, reply| broker.on_result(reply));
        Ok(())
    }

    /// Abort the outstanding run by killing and replacing the worker.
    ///
    /// Emits `Outcome::Cancelled` before returning. Returns `false` (and does
    /// nothing) when no run is outstanding.
    pub fn cancel(&mut self) -> bool {
        if self.state != BrokerState::Running {
            tracing::debug!(state = ?self.state, "cancel ignored, nothing running");
            return false;
        }

        let elapsed = self.run_started.take().map(|t| t.elapsed());
        tracing::info!(generation = %self.generation, ?elapsed, "cancelling run");

        self.retire_worker();
        self.state = BrokerState::Idle;
        self.callback.on_ready_changed(false);
        self.callback.on_outcome(Outcome::Cancelled);
        self.spawn_worker();
        true
    }

    /// Deliver one worker event.
    ///
    /// Events from any generation but the current one are dropped, as are
    /// events from a worker whose initialization already failed.
    pub fn handle_event(&mut self, event: WorkerEvent) {
        if self.closed || event.generation != self.generation || !self.scope.is_valid() {
            tracing::debug!(
                stale = %event.generation,
                current = %self.generation,
                "dropping stale worker event"
            );
            return;
        }

        match event.kind {
            WorkerEventKind::Reply(reply) => {
                let kind = reply.kind();
                match self.scope.take(event.generation, kind) {
                    Some(listener) => listener(self, reply),
                    None => tracing::debug!(?kind, "no listener for worker reply"),
                }
            }
            WorkerEventKind::Exited { reason } => self.on_worker_exited(reason),
        }
    }

    /// Deliver every event already queued, without waiting.
    pub fn pump(&mut self, events: &mut WorkerEvents) -> usize {
        let mut delivered = 0;
        while let Ok(event) = events.try_recv() {
            self.handle_event(event);
            delivered += 1;
        }
        delivered
    }

    /// Kill the worker for good. No outcome is emitted. Idempotent.
    pub fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.retire_worker();
        self.state = BrokerState::Idle;
        self.run_started = None;
        tracing::info!(generation = %self.generation, "broker torn down");
    }

    /// Invalidate the current scope, kill the worker, and advance the generation.
    fn retire_worker(&mut self) {
        self.scope.invalidate();
        if let Some(mut worker) = self.worker.take() {
            worker.terminate();
        }
        if !self.closed {
            self.generation = self.generation.next();
            self.scope = CancellationScope::create(self.generation);
        }
    }

    fn spawn_worker(&mut self) {
        let sink = EventSink::new(self.generation, self.scope.token(), self.events.clone());
        match WorkerHandle::spawn(self.launcher.as_ref(), &self.runtime_location, sink) {
            Ok(worker) => {
                self.worker = Some(worker);
                self.scope
                    .listen(ReplyKind::Init, |broker: &mut Self, reply| broker.on_init_reply(reply));
            }
            Err(e) => {
                tracing::error!(generation = %self.generation, "Failed to start worker: {}", e);
                self.worker = None;
                self.callback.on_init_failed(&e.to_string());
            }
        }
    }

    fn on_init_reply(&mut self, reply: WorkerReply) {
        let WorkerReply::Init { error } = reply else {
            return;
        };

        if let Some(message) = error {
            tracing::error!(generation = %self.generation, "Worker failed to initialize: {}", message);
            self.fail_initialization(&message);
            return;
        }

        let Some(worker) = self.worker.as_mut() else {
            return;
        };
        worker.mark_ready();
        if self.state == BrokerState::AwaitingReady {
            self.state = BrokerState::Idle;
        }
        tracing::info!(generation = %self.generation, pid = ?worker.id(), "worker ready");
        self.callback.on_ready_changed(true);
    }

    fn on_result(&mut self, reply: WorkerReply) {
        let WorkerReply::Result { payload } = reply else {
            return;
        };

        let outcome = ResultDecoder::decode(payload.as_bytes());
        let elapsed = self.run_started.take().map(|t| t.elapsed());
        self.state = BrokerState::Idle;

        tracing::debug!(
            generation = %self.generation,
            ?elapsed,
            success = outcome.is_success(),
            "run finished"
        );
        self.callback.on_outcome(outcome);
    }

    fn on_worker_exited(&mut self, reason: String) {
        if self.state == BrokerState::Running {
            tracing::warn!(generation = %self.generation, "Worker exited during run: {}", reason);
            self.run_started = None;
            self.retire_worker();
            self.state = BrokerState::Idle;
            self.callback.on_ready_changed(false);
            self.callback.on_outcome(Outcome::Failure {
                message: format!("worker exited unexpectedly: {}", reason),
            });
            self.spawn_worker();
        } else if self.is_ready() {
            tracing::warn!(generation = %self.generation, "Idle worker exited: {}", reason);
            self.retire_worker();
            self.callback.on_ready_changed(false);
            self.spawn_worker();
        } else {
            tracing::error!(generation = %self.generation, "Worker exited before initialization: {}", reason);
            self.fail_initialization(&format!("worker exited before initialization: {}", reason));
        }
    }

    /// Permanent for this worker: it stays unready and is not retried.
    ///
    /// The scope is invalidated so the dying worker's exit, queued or not,
    /// cannot report the same failure again.
    fn fail_initialization(&mut self, message: &str) {
        self.scope.invalidate();
        if let Some(worker) = self.worker.as_mut() {
            worker.terminate();
        }
        self.callback.on_init_failed(message);
    }
}

impl Drop for ExecutionBroker {
    fn drop(&mut self) {
        self.teardown();
    }
}
