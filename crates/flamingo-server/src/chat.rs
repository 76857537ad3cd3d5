//! Chat service: a [`SessionRegistry`] wired onto a [`TcpServer`].
//!
//! Every accepted connection gets a session; every disconnect drops it.
//! Inbound bytes are echoed back through the sender's session. Message
//! framing and the chat protocol proper belong to whatever sits on top.

use std::{
    fmt::Write as _,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use flamingo_net::{
    Address, Connection, ConnectionHandler, DEFAULT_READ_CHUNK_SIZE, ServerOptions, TcpServer,
    WriteOutcome,
};

use crate::{error::ServerError, session::SessionRegistry};

/// Bytes of a message included in a binary packet dump.
pub const HEX_DUMP_LIMIT: usize = 256;

/// Chat server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatServerConfig {
    /// Interface to listen on
    pub host: String,
    /// Port to listen on (0 picks a free one)
    pub port: u16,
    /// Server name, used in connection ids and logs
    pub name: String,
    /// Log a hex dump of every inbound message
    pub log_binary: bool,
    /// Bytes requested per socket read
    pub read_chunk_size: usize,
}

impl Default for ChatServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            name: "ChatServer".to_string(),
            log_binary: false,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

/// Connection handler for the chat service.
pub struct ChatService {
    sessions: Arc<SessionRegistry>,
    log_binary: AtomicBool,
}

impl ChatService {
    /// Service tracking sessions in `sessions`.
    pub fn new(sessions: Arc<SessionRegistry>, log_binary: bool) -> Self {
        Self { sessions, log_binary: AtomicBool::new(log_binary) }
    }

    /// Session registry.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Toggle binary packet logging.
    pub fn set_log_binary(&self, enabled: bool) {
        self.log_binary.store(enabled, Ordering::Relaxed);
    }

    /// Whether binary packet logging is on.
    pub fn log_binary(&self) -> bool {
        self.log_binary.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ConnectionHandler for ChatService {
    async fn on_connect(&self, conn: &Connection) {
        self.sessions.open(conn).await;
    }

    async fn on_disconnect(&self, conn: &Connection) {
        if self.sessions.close_connection(conn).await.is_none() {
            tracing::debug!(connection = %conn.id(), "disconnect without session");
        }
    }

    async fn on_message(&self, conn: &Connection, data: Bytes) {
        let Some(session) = self.sessions.session_for_connection(conn).await else {
            tracing::warn!(
                connection = %conn.id(),
                peer = %conn.peer_addr(),
                "message from unknown connection"
            );
            return;
        };

        tracing::info!(session = %session.id(), len = data.len(), "received message");
        if self.log_binary() {
            tracing::info!(session = %session.id(), dump = %hex_dump(&data), "message bytes");
        }

        match session.send(&data).await {
            Ok(WriteOutcome::Written(_)) => {},
            Ok(WriteOutcome::Closed) => {
                tracing::debug!(session = %session.id(), "echo dropped, connection closed");
            },
            Err(e) => {
                tracing::warn!(session = %session.id(), error = %e, "echo failed");
            },
        }
    }
}

/// A running (or startable) chat server.
pub struct ChatServer {
    server: TcpServer,
    service: Arc<ChatService>,
}

impl ChatServer {
    /// Validate `config`, resolve the listen address and build the server.
    ///
    /// Nothing is bound until [`ChatServer::start`].
    pub fn new(config: ChatServerConfig) -> Result<Self, ServerError> {
        if config.name.is_empty() {
            return Err(ServerError::Config("server name must not be empty".to_string()));
        }
        if config.read_chunk_size == 0 {
            return Err(ServerError::Config("read chunk size must be positive".to_string()));
        }

        let address = Address::resolve(&config.host, config.port)?;
        let service = Arc::new(ChatService::new(
            Arc::new(SessionRegistry::new()),
            config.log_binary,
        ));
        let options =
            ServerOptions { read_chunk_size: config.read_chunk_size, ..ServerOptions::default() };

        let handler: Arc<dyn ConnectionHandler> = service.clone();
        let server = TcpServer::with_options(config.name, address, handler, options);

        Ok(Self { server, service })
    }

    /// Bind and start accepting. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let local = self.server.start().await?;
        tracing::info!(
            server = %self.server.name(),
            address = %local,
            log_binary = self.service.log_binary(),
            "chat server started"
        );
        Ok(local)
    }

    /// Stop accepting, close every connection and drop every session.
    pub async fn stop(&self) {
        self.server.stop().await;
        let cleared = self.service.sessions().clear().await;
        tracing::info!(server = %self.server.name(), cleared, "chat server stopped");
    }

    /// Session registry.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        self.service.sessions()
    }

    /// Underlying TCP server.
    pub fn server(&self) -> &TcpServer {
        &self.server
    }

    /// Toggle binary packet logging at runtime.
    pub fn set_log_binary(&self, enabled: bool) {
        self.service.set_log_binary(enabled);
    }

    /// Whether binary packet logging is on.
    pub fn log_binary(&self) -> bool {
        self.service.log_binary()
    }
}

/// Lowercase hex of the first [`HEX_DUMP_LIMIT`] bytes.
fn hex_dump(data: &[u8]) -> String {
    let shown = &data[..data.len().min(HEX_DUMP_LIMIT)];
    let mut out = hex::encode(shown);

    if data.len() > shown.len() {
        let _ = write!(out, " ... ({} more)", data.len() - shown.len());
    }
    out
}
