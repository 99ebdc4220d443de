//! Playground session management.
//!
//! One session per WebSocket connection. Each session owns its own broker
//! and therefore its own worker; nothing is shared between connections.

use runbox_core::ipc::{WorkerEvents, WorkerLauncher};
use runbox_core::{
    BrokerConfig, BrokerNotice, BrokerState, ChannelCallback, Error as CoreError, ExecutionBroker,
};
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::error::{ServerError, ServerResult};
use crate::protocol::{ClientMessage, ServerMessage};

/// Reported when a run arrives before the worker acknowledged init.
pub const WORKER_NOT_READY: &str = "Worker not ready";

/// A playground session: one broker plus the channels that drive it.
pub struct PlaygroundSession {
    id: Uuid,
    broker: ExecutionBroker,
    events: WorkerEvents,
    notices: UnboundedReceiver<BrokerNotice>,
}

impl PlaygroundSession {
    /// Start a session backed by a worker process.
    pub fn new(config: &BrokerConfig) -> ServerResult<Self> {
        let (callback, notices) = ChannelCallback::new();
        let (broker, events) = ExecutionBroker::with_config(config, callback)?;
        Ok(Self::from_parts(broker, events, notices))
    }

    /// Start a session with a custom launcher.
    pub fn with_launcher(
        runtime_location: impl Into<String>,
        launcher: impl WorkerLauncher + 'static,
    ) -> Self {
        let (callback, notices) = ChannelCallback::new();
        let (broker, events) = ExecutionBroker::new(runtime_location, launcher, callback);
        Self::from_parts(broker, events, notices)
    }

    fn from_parts(
        broker: ExecutionBroker,
        events: WorkerEvents,
        notices: UnboundedReceiver<BrokerNotice>,
    ) -> Self {
        let id = Uuid::new_v4();
        tracing::info!(session = %id, "session started");
        Self {
            id,
            broker,
            events,
            notices,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> BrokerState {
        self.broker.state()
    }

    pub fn is_ready(&self) -> bool {
        self.broker.is_ready()
    }

    /// Apply a client request.
    ///
    /// Returns the immediate reply, if any. Broker reports caused by the
    /// request (such as a cancel's outcome) arrive through
    /// [`next_message`](Self::next_message).
    pub fn handle_client_message(&mut self, message: ClientMessage) -> Option<ServerMessage> {
        match message {
            ClientMessage::Run { code } => match self.start_run(code) {
                Ok(()) => Some(ServerMessage::Running),
                Err(ServerError::Core(CoreError::WorkerNotReady)) => {
                    Some(ServerMessage::error(WORKER_NOT_READY))
                }
                Err(e) => {
                    tracing::debug!(session = %self.id, "run rejected: {}", e);
                    Some(ServerMessage::error(e.to_string()))
                }
            },
            ClientMessage::Cancel => {
                if !self.broker.cancel() {
                    tracing::debug!(session = %self.id, "cancel ignored, nothing running");
                }
                None
            }
        }
    }

    fn start_run(&mut self, code: String) -> ServerResult<()> {
        if self.broker.state() == BrokerState::Running {
            return Err(ServerError::ExecutionInProgress);
        }
        self.broker.run(code)?;
        Ok(())
    }

    /// Wait for the next message to push to the client.
    ///
    /// Worker events are fed to the broker while waiting. Cancel safe:
    /// dropping the future loses no event and no notice.
    pub async fn next_message(&mut self) -> Option<ServerMessage> {
        loop {
            tokio::select! {
                biased;

                Some(notice) = self.notices.recv() => return Some(notice.into()),
                Some(event) = self.events.recv() => self.broker.handle_event(event),
                else => return None,
            }
        }
    }

    /// Kill the worker. No further messages are produced.
    pub fn close(&mut self) {
        self.broker.teardown();
        tracing::info!(session = %self.id, "session closed");
    }
}
