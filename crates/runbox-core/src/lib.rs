//! Core engine for runbox.
//!
//! This crate provides:
//! - The framed JSON protocol spoken with worker processes
//! - `WorkerHandle` for the spawn/send/terminate lifecycle of one worker
//! - `CancellationScope` for making superseded replies unobservable
//! - `ResultDecoder` for turning raw worker payloads into outcomes
//! - `ExecutionBroker`, the run/cancel state machine driven by the UI layer

pub mod error;
pub mod execute;
pub mod ipc;

pub use error::{Error, Result};
pub use execute::{
    BrokerConfig, BrokerNotice, BrokerState, CancellationScope, ChannelCallback, ExecutionBroker,
    ExecutionCallback, Outcome, ResultDecoder, ScopeToken,
};
pub use ipc::{
    EventSink, Generation, ProcessLauncher, WorkerEvent, WorkerEventKind, WorkerEvents,
    WorkerHandle, WorkerLauncher, WorkerReply, WorkerRequest, WorkerTransport,
};
