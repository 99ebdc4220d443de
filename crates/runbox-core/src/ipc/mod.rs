//! Inter-process communication for runbox worker processes.
//!
//! This module provides the protocol and utilities for communicating
//! with isolated worker processes that execute source text.

pub mod protocol;
mod worker;

pub use protocol::{
    Envelope, ReplyKind, WorkerReply, WorkerRequest, read_message, write_message,
};
pub use worker::{
    EventSink, Generation, ProcessLauncher, WORKER_PATH_ENV, WorkerEvent, WorkerEventKind,
    WorkerEvents, WorkerHandle, WorkerLauncher, WorkerTransport, find_worker_binary,
};
