//! Flamingo service layer.
//!
//! Building blocks for services that sit on the `flamingo-net` engine:
//!
//! - [`SessionRegistry`]: sessions per connection, indexed by user for
//!   multi-device routing and broadcast
//! - [`TaskQueue`] / [`WorkerPool`]: bounded offload of blocking data-store
//!   calls, with explicit backpressure
//! - [`DataStore`]: the data-access collaborator workers call, plus an
//!   in-memory [`MemoryStore`]
//! - [`ChatServer`]: the chat service, which ties a registry to a TCP server
//!
//! # Ownership
//!
//! The TCP server owns connections, the registry owns sessions, the worker
//! pool owns its queue. Components are plain values built at startup and
//! passed by reference or `Arc`; there are no process-wide singletons.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod chat;
mod error;
mod session;
pub mod store;
mod task;
mod worker;

pub use chat::{ChatServer, ChatServerConfig, ChatService, HEX_DUMP_LIMIT};
pub use error::{ServerError, SessionError};
pub use session::{
    BroadcastReport, BroadcastTarget, ClientType, Profile, Session, SessionId, SessionRegistry,
};
pub use store::{DataStore, MemoryStore, StoreError};
pub use task::{
    DEFAULT_SUBMIT_TIMEOUT, QueueStats, SubmitError, Task, TaskCallback, TaskError, TaskKind,
    TaskOp, TaskOutput, TaskQueue,
};
pub use worker::{PoolStats, WorkerPool, WorkerPoolConfig};
