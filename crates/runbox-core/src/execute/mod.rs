//! Execution orchestration for runbox.
//!
//! # Architecture
//!
//! ```text
//! UI driver (server session / CLI)
//!     │  run(code) / cancel()          ▲ on_ready_changed / on_outcome
//!     ▼                                │
//! ExecutionBroker ── CancellationScope (one per generation)
//!     │                                ▲
//!     │                                │ WorkerEvent { generation, reply }
//!     └── WorkerHandle ── IPC: init / run ──► runbox-worker process
//!                                      │
//!                                      └── ResultDecoder → Outcome
//! ```
//!
//! Cancel kills the worker (SIGKILL to its process group), bumps the
//! generation, and spawns a replacement. Replies from older generations are
//! dropped wherever they are found.
//!
//! # Module Structure
//!
//! - `broker` - ExecutionBroker state machine
//! - `context` - ExecutionCallback and channel-backed notices
//! - `decoder` - ResultDecoder and Outcome
//! - `scope` - CancellationScope and ScopeToken

mod broker;
mod context;
mod decoder;
mod scope;

pub use broker::{BrokerConfig, BrokerState, ExecutionBroker};
pub use context::{BrokerNotice, ChannelCallback, ExecutionCallback};
pub use decoder::{EMPTY_OUTPUT, GENERIC_FAILURE, Outcome, ResultDecoder};
pub use scope::{CancellationScope, Listener, ScopeToken};
