//! TCP server: listening socket, accept loop, connection table.
//!
//! The server owns every accepted [`Connection`] until it disconnects. One
//! task runs the accept loop; each accepted connection gets its own task that
//! runs `on_connect`, then the read loop, then unregisters the connection and
//! runs `on_disconnect`.
//!
//! `stop()` may be called from any task. It unblocks the accept loop, waits
//! for it to exit (dropping the listener), then closes every connection that
//! is still registered.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Mutex, RwLock, watch},
    task::JoinHandle,
};

use crate::{
    address::Address,
    connection::{Connection, ConnectionHandler, ConnectionId, DEFAULT_READ_CHUNK_SIZE},
    error::NetError,
};

/// Pause after a failed accept so a persistent error (e.g. out of file
/// descriptors) does not spin the accept loop.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Per-server socket options.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Bytes requested per socket read
    pub read_chunk_size: usize,
    /// Set `TCP_NODELAY` on accepted sockets
    pub nodelay: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self { read_chunk_size: DEFAULT_READ_CHUNK_SIZE, nodelay: true }
    }
}

struct ServerInner {
    name: Arc<str>,
    address: Address,
    options: ServerOptions,
    handler: Arc<dyn ConnectionHandler>,
    /// Connection ID → live connection
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    next_seq: AtomicU64,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
    local_addr: OnceLock<SocketAddr>,
}

/// TCP server that fans connection events out to one [`ConnectionHandler`].
pub struct TcpServer {
    inner: Arc<ServerInner>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpServer {
    /// Create a server with default options. Nothing is bound until
    /// [`TcpServer::start`].
    pub fn new(
        name: impl Into<Arc<str>>,
        address: Address,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        Self::with_options(name, address, handler, ServerOptions::default())
    }

    /// Create a server with explicit socket options.
    pub fn with_options(
        name: impl Into<Arc<str>>,
        address: Address,
        handler: Arc<dyn ConnectionHandler>,
        options: ServerOptions,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(ServerInner {
                name: name.into(),
                address,
                options,
                handler,
                connections: RwLock::new(HashMap::new()),
                next_seq: AtomicU64::new(1),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                shutdown,
                local_addr: OnceLock::new(),
            }),
            accept_task: Mutex::new(None),
        }
    }

    /// Bind, listen and spawn the accept loop.
    ///
    /// Returns as soon as the listener is bound, with the actual local address
    /// (useful when binding port 0). A failed bind leaves the server
    /// startable again.
    pub async fn start(&self) -> Result<SocketAddr, NetError> {
        let inner = &self.inner;

        if inner.stopped.load(Ordering::Acquire) || inner.started.swap(true, Ordering::AcqRel) {
            return Err(NetError::AlreadyStarted(inner.name.to_string()));
        }

        let bind_addr = inner.address.socket_addr();
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                inner.started.store(false, Ordering::Release);
                tracing::error!(
                    server = %inner.name,
                    address = %bind_addr,
                    error = %source,
                    "listen failed"
                );
                return Err(NetError::Bind { address: bind_addr, source });
            },
        };

        let local = listener.local_addr().map_err(|source| {
            inner.started.store(false, Ordering::Release);
            NetError::Bind { address: bind_addr, source }
        })?;
        let _ = inner.local_addr.set(local);

        tracing::info!(server = %inner.name, address = %local, "server started");

        let handle = tokio::spawn(accept_loop(Arc::clone(inner), listener));
        *self.accept_task.lock().await = Some(handle);

        Ok(local)
    }

    /// Stop accepting, close every connection and clear the table.
    ///
    /// Idempotent. Waits for the accept loop to exit, so the listening socket
    /// is closed by the time this returns. Connection tasks finish on their
    /// own and still deliver `on_disconnect`.
    pub async fn stop(&self) {
        let inner = &self.inner;

        if inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.shutdown.send_replace(true);

        if let Some(handle) = self.accept_task.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!(server = %inner.name, error = %e, "accept loop ended abnormally");
            }
        }

        let drained: Vec<Connection> =
            inner.connections.write().await.drain().map(|(_, conn)| conn).collect();
        for conn in &drained {
            conn.close();
        }

        tracing::info!(server = %inner.name, closed = drained.len(), "server stopped");
    }

    /// Service name used in connection ids and logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Configured listen address.
    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    /// Bound address. `None` until `start()` succeeds.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    /// Whether the server has started and not been stopped.
    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::Acquire) && !self.inner.stopped.load(Ordering::Acquire)
    }

    /// Look up a live connection.
    pub async fn connection(&self, id: &ConnectionId) -> Option<Connection> {
        self.inner.connections.read().await.get(id).cloned()
    }

    /// Snapshot of every live connection.
    pub async fn connections(&self) -> Vec<Connection> {
        self.inner.connections.read().await.values().cloned().collect()
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        // Unblock the accept loop so the listener does not outlive us.
        if !self.inner.stopped.swap(true, Ordering::AcqRel) {
            self.inner.shutdown.send_replace(true);
        }
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    let mut shutdown = inner.shutdown.subscribe();

    loop {
        if inner.stopped.load(Ordering::Acquire) {
            break;
        }

        let accepted = tokio::select! {
            biased;
            _ = shutdown.changed() => continue,
            result = listener.accept() => result,
        };

        match accepted {
            Ok((stream, peer)) => register(&inner, stream, peer).await,
            Err(e) => {
                if inner.stopped.load(Ordering::Acquire) {
                    break;
                }
                tracing::error!(server = %inner.name, error = %e, "accept error");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            },
        }
    }

    tracing::debug!(server = %inner.name, "accept loop exited");
}

async fn register(inner: &Arc<ServerInner>, stream: TcpStream, peer: SocketAddr) {
    let local = match stream.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::warn!(server = %inner.name, %peer, error = %e, "dropping accepted socket");
            return;
        },
    };

    if inner.options.nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(server = %inner.name, %peer, error = %e, "set_nodelay failed");
        }
    }

    let seq = inner.next_seq.fetch_add(1, Ordering::Relaxed);
    let id = ConnectionId::new(Arc::clone(&inner.name), seq);
    let (reader, writer) = stream.into_split();
    let conn = Connection::new(
        id.clone(),
        Address::from(local),
        Address::from(peer),
        Box::new(writer),
        Arc::clone(&inner.handler),
    );

    inner.connections.write().await.insert(id.clone(), conn.clone());

    // stop() may have drained the table while we were inserting
    if inner.stopped.load(Ordering::Acquire) {
        conn.close();
    }

    tracing::info!(server = %inner.name, conn = %id, %peer, "connection accepted");

    let inner = Arc::clone(inner);
    let chunk_size = inner.options.read_chunk_size;
    tokio::spawn(async move {
        inner.handler.on_connect(&conn).await;
        conn.read_loop(reader, chunk_size).await;

        inner.connections.write().await.remove(conn.id());
        inner.handler.on_disconnect(&conn).await;

        tracing::info!(server = %inner.name, conn = %conn.id(), "connection removed");
    });
}
