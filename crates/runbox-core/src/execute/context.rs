//! Callbacks through which the broker reports to its UI layer.

use tokio::sync::mpsc;

use super::decoder::Outcome;

/// Callback trait for broker state reporting.
///
/// The implementor is the single driver of its broker: it must only call
/// `run` while the broker is idle and `cancel` while it is running.
pub trait ExecutionCallback: Send + Sync {
    /// Called when the current worker becomes ready or stops being ready.
    fn on_ready_changed(&self, ready: bool);

    /// Called exactly once per run attempt.
    fn on_outcome(&self, outcome: Outcome);

    /// Called when a worker can never become ready (runtime failed to load,
    /// worker failed to start, or it died before acknowledging init).
    fn on_init_failed(&self, _message: &str) {}
}

/// A broker report as a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerNotice {
    ReadyChanged(bool),
    Outcome(Outcome),
    InitFailed(String),
}

/// Forwards broker reports into an unbounded channel.
///
/// # Example
///
/// ```
/// use runbox_core::execute::{BrokerNotice, ChannelCallback, ExecutionCallback};
///
/// let (callback, mut notices) = ChannelCallback::new();
/// callback.on_ready_changed(true);
///
/// assert_eq!(notices.try_recv().unwrap(), BrokerNotice::ReadyChanged(true));
/// ```
#[derive(Clone)]
pub struct ChannelCallback {
    tx: mpsc::UnboundedSender<BrokerNotice>,
}

impl ChannelCallback {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BrokerNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, notice: BrokerNotice) {
        if self.tx.send(notice).is_err() {
            tracing::debug!("broker notice dropped, receiver is gone");
        }
    }
}

impl ExecutionCallback for ChannelCallback {
    fn on_ready_changed(&self, ready: bool) {
        self.send(BrokerNotice::ReadyChanged(ready));
    }

    fn on_outcome(&self, outcome: Outcome) {
        self.send(BrokerNotice::Outcome(outcome));
    }

    fn on_init_failed(&self, message: &str) {
        self.send(BrokerNotice::InitFailed(message.to_string()));
    }
}
