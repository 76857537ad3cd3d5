//! Accepted TCP connections.
//!
//! A [`Connection`] is a cheap, clonable handle to one accepted socket. The
//! socket is split in two: the read half is owned by the connection's read
//! loop, the write half sits behind a single async mutex so concurrent writers
//! never interleave bytes.
//!
//! # Lifecycle
//!
//! ```text
//! accept ──> on_connect ──> read loop ──(EOF / error / close)──> on_disconnect
//!                             │
//!                             └──> on_message (awaited, in read order)
//! ```
//!
//! `close()` flips the closed flag exactly once, wakes the read loop and drops
//! the write half (or leaves that to an in-flight writer). After that every
//! `write()` reports [`WriteOutcome::Closed`].

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{Mutex, MutexGuard, watch},
};

use crate::{address::Address, buffer::ByteBuffer, error::NetError};

/// Bytes requested from the socket per read call.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

/// Write half of a connection, type-erased so tests can substitute pipes.
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Identity of a connection: owning service name plus a sequence number.
///
/// Sequence numbers start at 1 and are never reused for the lifetime of the
/// server that assigned them. Renders as `"<service>#<seq>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    service: Arc<str>,
    seq: u64,
}

impl ConnectionId {
    /// Build an id from a service name and sequence number.
    pub fn new(service: impl Into<Arc<str>>, seq: u64) -> Self {
        Self { service: service.into(), seq }
    }

    /// Name of the service that accepted the connection.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Per-server sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.service, self.seq)
    }
}

/// Result of a [`Connection::write`] that did not hit a transport error.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// All bytes were handed to the OS.
    Written(usize),
    /// Connection was already closed; nothing was written.
    Closed,
}

/// Lifecycle callbacks a service registers with a [`crate::TcpServer`].
///
/// Every method runs on the connection's own task, so a slow implementation
/// stalls that connection's I/O (and only that connection's). In particular,
/// the read loop awaits `on_message` before reading again, which is how a slow
/// consumer pushes back on its peer.
///
/// All methods default to no-ops.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Connection accepted. Runs before the first `on_message`.
    async fn on_connect(&self, _conn: &Connection) {}

    /// Connection is gone: peer closed, read failed, or it was closed locally.
    ///
    /// Invoked exactly once per connection, after it has been removed from the
    /// server's connection table.
    async fn on_disconnect(&self, _conn: &Connection) {}

    /// Bytes arrived, exactly as read from the socket (no framing).
    async fn on_message(&self, _conn: &Connection, _data: Bytes) {}

    /// A `write()` call handed all of its bytes to the OS.
    async fn on_write_complete(&self, _conn: &Connection) {}
}

struct ConnectionInner {
    id: ConnectionId,
    local: Address,
    peer: Address,
    writer: Mutex<Option<BoxedWriter>>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    buffer: Mutex<ByteBuffer>,
    handler: Arc<dyn ConnectionHandler>,
}

/// Handle to one accepted connection.
///
/// Clones share the same socket and state. Equality is identity: two handles
/// are equal when they refer to the same underlying connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        local: Address,
        peer: Address,
        writer: BoxedWriter,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(ConnectionInner {
                id,
                local,
                peer,
                writer: Mutex::new(Some(writer)),
                closed: AtomicBool::new(false),
                shutdown,
                buffer: Mutex::new(ByteBuffer::new()),
                handler,
            }),
        }
    }

    /// Connection identity.
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// Local end of the socket.
    pub fn local_addr(&self) -> &Address {
        &self.inner.local
    }

    /// Remote end of the socket.
    pub fn peer_addr(&self) -> &Address {
        &self.inner.peer
    }

    /// Whether `close()` has run (locally or because the read loop ended).
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Lock the connection's staging buffer.
    ///
    /// Services use it to accumulate partial frames between `on_message`
    /// calls. The core never touches it.
    pub async fn buffer(&self) -> MutexGuard<'_, ByteBuffer> {
        self.inner.buffer.lock().await
    }

    /// Write all of `data` to the peer.
    ///
    /// Writes are serialized per connection. On success the write-complete
    /// callback runs after the writer lock is released, so it may write
    /// again. Writing to a closed connection is a no-op that returns
    /// [`WriteOutcome::Closed`]. A write still pending when `close()` runs is
    /// abandoned (the peer may have received a prefix) and also returns
    /// `Closed`.
    pub async fn write(&self, data: &[u8]) -> Result<WriteOutcome, NetError> {
        if self.is_closed() {
            return Ok(WriteOutcome::Closed);
        }

        {
            let mut writer = self.inner.writer.lock().await;
            let mut shutdown = self.inner.shutdown.subscribe();

            if self.is_closed() {
                writer.take();
                return Ok(WriteOutcome::Closed);
            }

            let Some(stream) = writer.as_mut() else {
                return Ok(WriteOutcome::Closed);
            };

            // A peer that stopped reading must not pin the write half past close()
            let written = tokio::select! {
                result = write_fully(stream, data) => Some(result),
                _ = shutdown.changed() => None,
            };

            match written {
                Some(Ok(())) => {},
                Some(Err(e)) => {
                    tracing::debug!(conn = %self.inner.id, error = %e, "write failed");
                    return Err(NetError::Write(e));
                },
                None => {
                    writer.take();
                    tracing::debug!(conn = %self.inner.id, "write abandoned: closed mid-write");
                    return Ok(WriteOutcome::Closed);
                },
            }

            // close() could not take the write half while we held it
            if self.is_closed() {
                writer.take();
            }
        }

        self.inner.handler.on_write_complete(self).await;
        Ok(WriteOutcome::Written(data.len()))
    }

    /// Close the connection.
    ///
    /// Idempotent: returns `true` only for the call that actually closed it.
    /// Never waits on an in-flight write; if one holds the write half, that
    /// writer is woken, abandons the write and drops it.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.inner.shutdown.send_replace(true);

        if let Ok(mut writer) = self.inner.writer.try_lock() {
            writer.take();
        }

        tracing::debug!(conn = %self.inner.id, peer = %self.inner.peer, "connection closed");
        true
    }

    /// Drive the read side until EOF, a read error, or `close()`.
    ///
    /// Each successful read is copied out and handed to `on_message`, which is
    /// awaited before the next read. Always leaves the connection closed. The
    /// disconnect callback is the caller's job, once the connection has been
    /// unregistered.
    pub(crate) async fn read_loop<R>(&self, mut reader: R, chunk_size: usize)
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut chunk = vec![0u8; chunk_size.max(1)];

        loop {
            if self.is_closed() {
                tracing::debug!(conn = %self.inner.id, "read loop stopping: closed locally");
                break;
            }

            let read = tokio::select! {
                result = reader.read(&mut chunk) => result,
                _ = shutdown.changed() => continue,
            };

            match read {
                Ok(0) => {
                    tracing::debug!(conn = %self.inner.id, "peer closed connection");
                    break;
                },
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&chunk[..n]);
                    self.inner.handler.on_message(self, data).await;
                },
                Err(e) => {
                    let err = NetError::Read(e);
                    tracing::warn!(conn = %self.inner.id, error = %err, "read error");
                    break;
                },
            }
        }

        self.close();
    }
}

async fn write_fully(stream: &mut BoxedWriter, data: &[u8]) -> std::io::Result<()> {
    stream.write_all(data).await?;
    stream.flush().await
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Detached connections for tests.
///
/// A detached connection is not attached to any server or socket: its write
/// half is one end of an in-memory pipe, and the other end is returned so a
/// test can read exactly what was written.
#[cfg(any(test, feature = "test-util"))]
pub mod testing {
    use std::{net::SocketAddr, sync::Arc};

    use tokio::io::DuplexStream;

    use super::{Connection, ConnectionHandler, ConnectionId};
    use crate::address::Address;

    /// Pipe capacity for detached connections.
    pub const DETACHED_PIPE_CAPACITY: usize = 64 * 1024;

    /// Handler that ignores every callback.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NoopHandler;

    impl ConnectionHandler for NoopHandler {}

    /// Create a detached connection with a no-op handler.
    pub fn detached(service: &str, seq: u64) -> (Connection, DuplexStream) {
        detached_with_handler(service, seq, Arc::new(NoopHandler))
    }

    /// Create a detached connection that reports to `handler`.
    pub fn detached_with_handler(
        service: &str,
        seq: u64,
        handler: Arc<dyn ConnectionHandler>,
    ) -> (Connection, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(DETACHED_PIPE_CAPACITY);
        let local = Address::from(SocketAddr::from(([127, 0, 0, 1], 0)));
        let peer = Address::from(SocketAddr::from(([127, 0, 0, 1], 1)));

        let conn =
            Connection::new(ConnectionId::new(service, seq), local, peer, Box::new(ours), handler);
        (conn, theirs)
    }

    /// Run a detached connection's read loop over `reader` to completion.
    pub async fn drive_reader<R>(conn: &Connection, reader: R, chunk_size: usize)
    where
        R: tokio::io::AsyncRead + Unpin + Send,
    {
        conn.read_loop(reader, chunk_size).await;
    }
}
