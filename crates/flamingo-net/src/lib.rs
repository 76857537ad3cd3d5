//! Flamingo network engine.
//!
//! Connection-oriented TCP runtime that protocol services are built on. The
//! engine accepts sockets, runs one read loop per connection, serializes
//! writes, and reports lifecycle events to a service-supplied
//! [`ConnectionHandler`]. It knows nothing about framing: services receive raw
//! bytes and can use [`ByteBuffer`] to encode and decode fixed-width
//! big-endian integers.
//!
//! # Components
//!
//! - [`Address`]: host/port pair, resolved once
//! - [`ByteBuffer`]: growable byte accumulator with big-endian codecs
//! - [`Connection`]: one accepted socket with a read loop and a single write path
//! - [`TcpServer`]: listener, accept loop and connection table
//!
//! # Concurrency
//!
//! One tokio task runs the accept loop and one task per connection runs its
//! read loop. Inbound bytes for a connection are delivered strictly in the
//! order they were read; the read loop does not read again until
//! [`ConnectionHandler::on_message`] returns. No lock is held while a callback
//! runs.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod address;
mod buffer;
mod connection;
mod error;
mod server;

pub use address::Address;
pub use buffer::{ByteBuffer, DEFAULT_BUFFER_CAPACITY};
#[cfg(any(test, feature = "test-util"))]
pub use connection::testing;
pub use connection::{
    Connection, ConnectionHandler, ConnectionId, DEFAULT_READ_CHUNK_SIZE, WriteOutcome,
};
pub use error::{BufferError, NetError};
pub use server::{ACCEPT_ERROR_BACKOFF, ServerOptions, TcpServer};
