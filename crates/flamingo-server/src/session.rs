//! Sessions and the per-service session registry.
//!
//! A [`Session`] is the service-level view of one connection: who is on the
//! other end (user id, client type) and their presence status. The
//! [`SessionRegistry`] indexes sessions three ways:
//!
//! - session id → session (primary map)
//! - connection id → session id (disconnect lookup)
//! - user id → sessions, in authentication order (multi-device routing)
//!
//! All three live under one `RwLock`, so every change keeps them consistent:
//! a session is in the user index iff its user id is non-zero and it is in the
//! primary map. Nothing is written to a socket while the lock is held.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, PoisonError, RwLock as StdRwLock,
        atomic::{AtomicI32, AtomicU8, AtomicU64, Ordering},
    },
};

use flamingo_net::{Connection, ConnectionId, NetError, WriteOutcome};
use tokio::sync::RwLock;

use crate::error::SessionError;

/// Registry-assigned session identifier. Starts at 1, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw id.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session_{}", self.0)
    }
}

/// Device class a user is connected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ClientType {
    /// Not reported yet
    #[default]
    Unknown = 0,
    /// Desktop (Windows/Linux)
    Pc = 1,
    /// Android phone or tablet
    Android = 2,
    /// iPhone or iPad
    Ios = 3,
    /// macOS desktop
    Mac = 4,
}

impl ClientType {
    /// Decode a wire code. Unrecognized codes map to `Unknown`.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Pc,
            2 => Self::Android,
            3 => Self::Ios,
            4 => Self::Mac,
            _ => Self::Unknown,
        }
    }

    /// Wire code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Phone or tablet.
    pub fn is_mobile(self) -> bool {
        matches!(self, Self::Android | Self::Ios)
    }
}

/// One client connection as seen by a service.
///
/// Holds a handle to its connection but does not own the socket's lifetime:
/// the server tears the connection down and the registry drops the session
/// in response.
pub struct Session {
    id: SessionId,
    conn: Connection,
    user_id: AtomicU64,
    client_type: AtomicU8,
    status: AtomicI32,
    profile: StdRwLock<Profile>,
}

/// Display names a service attaches after login. Empty until set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    /// Login name
    pub username: String,
    /// Name shown to other users
    pub nickname: String,
}

impl Session {
    fn new(id: SessionId, conn: Connection) -> Self {
        Self {
            id,
            conn,
            user_id: AtomicU64::new(0),
            client_type: AtomicU8::new(ClientType::Unknown.code()),
            status: AtomicI32::new(0),
            profile: StdRwLock::new(Profile::default()),
        }
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Authenticated user, or 0.
    pub fn user_id(&self) -> u64 {
        self.user_id.load(Ordering::Acquire)
    }

    /// Reported client type.
    pub fn client_type(&self) -> ClientType {
        ClientType::from_code(self.client_type.load(Ordering::Acquire))
    }

    /// Presence status code. Meaning is up to the service.
    pub fn status(&self) -> i32 {
        self.status.load(Ordering::Acquire)
    }

    /// Update the presence status code.
    pub fn set_status(&self, status: i32) {
        self.status.store(status, Ordering::Release);
    }

    /// Snapshot of the session's profile.
    pub fn profile(&self) -> Profile {
        self.profile.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Login name, empty if unset.
    pub fn username(&self) -> String {
        self.profile.read().unwrap_or_else(PoisonError::into_inner).username.clone()
    }

    /// Display name, empty if unset.
    pub fn nickname(&self) -> String {
        self.profile.read().unwrap_or_else(PoisonError::into_inner).nickname.clone()
    }

    /// Replace the profile.
    pub fn set_profile(&self, profile: Profile) {
        *self.profile.write().unwrap_or_else(PoisonError::into_inner) = profile;
    }

    /// Whether a user has authenticated on this session.
    pub fn is_authenticated(&self) -> bool {
        self.user_id() != 0
    }

    /// Whether the connection is still open.
    pub fn is_valid(&self) -> bool {
        !self.conn.is_closed()
    }

    /// Write to the session's connection.
    pub async fn send(&self, data: &[u8]) -> Result<WriteOutcome, NetError> {
        self.conn.write(data).await
    }

    /// Close the session's connection. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        self.conn.close()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("connection", self.conn.id())
            .field("user_id", &self.user_id())
            .field("client_type", &self.client_type())
            .field("status", &self.status())
            .field("username", &self.username())
            .finish()
    }
}

/// Who a broadcast goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastTarget {
    /// Every session of one user
    User(u64),
    /// Every session in the registry
    All,
}

/// Per-session write results of a broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Payload handed to the OS
    pub delivered: usize,
    /// Connection was already closed
    pub closed: usize,
    /// Write failed at the transport
    pub failed: usize,
}

impl BroadcastReport {
    /// Sessions the broadcast was attempted on.
    pub fn attempted(&self) -> usize {
        self.delivered + self.closed + self.failed
    }
}

#[derive(Default)]
struct RegistryInner {
    /// Session ID → session
    sessions: HashMap<SessionId, Arc<Session>>,
    /// Connection ID → session ID
    by_connection: HashMap<ConnectionId, SessionId>,
    /// User ID → sessions in authentication order. Never holds empty buckets
    by_user: HashMap<u64, Vec<Arc<Session>>>,
    next_id: u64,
}

impl RegistryInner {
    fn remove(&mut self, id: SessionId) -> Option<Arc<Session>> {
        let session = self.sessions.remove(&id)?;
        self.by_connection.remove(session.conn.id());
        self.unlink_user(&session);
        Some(session)
    }

    fn unlink_user(&mut self, session: &Session) {
        let user_id = session.user_id();
        if user_id == 0 {
            return;
        }

        if let Some(bucket) = self.by_user.get_mut(&user_id) {
            bucket.retain(|s| s.id != session.id);
            if bucket.is_empty() {
                self.by_user.remove(&user_id);
            }
        }
    }
}

/// Sessions of one service, indexed by id, connection and user.
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Create an empty registry. The first session gets id 1.
    pub fn new() -> Self {
        Self { inner: RwLock::new(RegistryInner { next_id: 1, ..Default::default() }) }
    }

    /// Create a session for a newly accepted connection.
    ///
    /// Opening the same connection twice returns the existing session.
    pub async fn open(&self, conn: &Connection) -> Arc<Session> {
        let mut inner = self.inner.write().await;

        if let Some(existing) =
            inner.by_connection.get(conn.id()).and_then(|id| inner.sessions.get(id))
        {
            return Arc::clone(existing);
        }

        let id = SessionId(inner.next_id);
        inner.next_id += 1;

        let session = Arc::new(Session::new(id, conn.clone()));
        inner.sessions.insert(id, Arc::clone(&session));
        inner.by_connection.insert(conn.id().clone(), id);
        drop(inner);

        tracing::info!(
            session = %id,
            connection = %conn.id(),
            peer = %conn.peer_addr(),
            "session opened"
        );
        session
    }

    /// Remove the session bound to `conn` and close it.
    ///
    /// Returns the removed session, or `None` if the connection had none.
    pub async fn close_connection(&self, conn: &Connection) -> Option<Arc<Session>> {
        let session = {
            let mut inner = self.inner.write().await;
            let id = inner.by_connection.get(conn.id()).copied()?;
            inner.remove(id)?
        };

        session.close();
        tracing::info!(session = %session.id, user_id = session.user_id(), "session removed");
        Some(session)
    }

    /// Remove a session by id and close its connection.
    pub async fn remove(&self, id: SessionId) -> Result<Arc<Session>, SessionError> {
        let session = self.inner.write().await.remove(id).ok_or(SessionError::NotFound(id))?;

        session.close();
        tracing::info!(session = %id, user_id = session.user_id(), "session removed");
        Ok(session)
    }

    /// Bind a session to a user and client type.
    ///
    /// The session is appended to the user's bucket. Re-authenticating as the
    /// same user keeps its position; switching users moves it.
    pub async fn authenticate(
        &self,
        id: SessionId,
        user_id: u64,
        client_type: ClientType,
    ) -> Result<Arc<Session>, SessionError> {
        if user_id == 0 {
            return Err(SessionError::InvalidUserId);
        }

        let mut inner = self.inner.write().await;
        let session = inner.sessions.get(&id).cloned().ok_or(SessionError::NotFound(id))?;

        let previous = session.user_id();
        if previous != user_id {
            inner.unlink_user(&session);
            session.user_id.store(user_id, Ordering::Release);
            inner.by_user.entry(user_id).or_default().push(Arc::clone(&session));
        }
        session.client_type.store(client_type.code(), Ordering::Release);
        drop(inner);

        tracing::info!(session = %id, user_id, previous, ?client_type, "session authenticated");
        Ok(session)
    }

    /// Session by id.
    pub async fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.inner.read().await.sessions.get(&id).cloned()
    }

    /// Session bound to `conn`.
    pub async fn session_for_connection(&self, conn: &Connection) -> Option<Arc<Session>> {
        let inner = self.inner.read().await;
        inner.by_connection.get(conn.id()).and_then(|id| inner.sessions.get(id)).cloned()
    }

    /// Snapshot of every session, ordered by id.
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.inner.read().await.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Snapshot of a user's sessions in authentication order.
    ///
    /// Later registry changes do not affect the returned vector.
    pub async fn sessions_for_user(&self, user_id: u64) -> Vec<Arc<Session>> {
        self.inner.read().await.by_user.get(&user_id).cloned().unwrap_or_default()
    }

    /// First session of `user_id` with the given client type.
    pub async fn session_for_user_and_client_type(
        &self,
        user_id: u64,
        client_type: ClientType,
    ) -> Option<Arc<Session>> {
        let inner = self.inner.read().await;
        inner.by_user.get(&user_id)?.iter().find(|s| s.client_type() == client_type).cloned()
    }

    /// Status of the user's first session. 0 when the user has none.
    pub async fn user_status(&self, user_id: u64) -> i32 {
        let inner = self.inner.read().await;
        inner.by_user.get(&user_id).and_then(|b| b.first()).map_or(0, |s| s.status())
    }

    /// Client type of the user's first session. `Unknown` when the user has
    /// none.
    pub async fn user_client_type(&self, user_id: u64) -> ClientType {
        let inner = self.inner.read().await;
        inner
            .by_user
            .get(&user_id)
            .and_then(|b| b.first())
            .map_or(ClientType::Unknown, |s| s.client_type())
    }

    /// Users with at least one session, ascending.
    pub async fn user_ids(&self) -> Vec<u64> {
        let mut ids: Vec<_> = self.inner.read().await.by_user.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Write `payload` to every targeted session.
    ///
    /// Targets are snapshotted first; the writes happen with the registry
    /// unlocked, so a slow peer never blocks other registry calls.
    pub async fn broadcast(&self, target: BroadcastTarget, payload: &[u8]) -> BroadcastReport {
        let targets = match target {
            BroadcastTarget::User(user_id) => self.sessions_for_user(user_id).await,
            BroadcastTarget::All => self.sessions().await,
        };

        let mut report = BroadcastReport::default();
        for session in targets {
            match session.send(payload).await {
                Ok(WriteOutcome::Written(_)) => report.delivered += 1,
                Ok(WriteOutcome::Closed) => report.closed += 1,
                Err(e) => {
                    tracing::debug!(session = %session.id, error = %e, "broadcast write failed");
                    report.failed += 1;
                },
            }
        }

        tracing::debug!(?target, len = payload.len(), ?report, "broadcast finished");
        report
    }

    /// Number of sessions.
    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// True when no session is registered.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.sessions.is_empty()
    }

    /// Number of users with at least one session.
    pub async fn user_count(&self) -> usize {
        self.inner.read().await.by_user.len()
    }

    /// Close and remove every session. Ids keep counting up afterwards.
    pub async fn clear(&self) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.inner.write().await;
            inner.by_connection.clear();
            inner.by_user.clear();
            inner.sessions.drain().map(|(_, s)| s).collect()
        };

        for session in &drained {
            session.close();
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "sessions cleared");
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use flamingo_net::testing::detached;
    use tokio::io::AsyncReadExt;

    use super::*;

    fn conn(seq: u64) -> Connection {
        detached("Chat", seq).0
    }

    #[test]
    fn session_id_display() {
        assert_eq!(SessionId::new(42).to_string(), "session_42");
    }

    #[test]
    fn client_type_codes() {
        for ct in [
            ClientType::Unknown,
            ClientType::Pc,
            ClientType::Android,
            ClientType::Ios,
            ClientType::Mac,
        ] {
            assert_eq!(ClientType::from_code(ct.code()), ct);
        }
        assert_eq!(ClientType::from_code(200), ClientType::Unknown);
        assert!(ClientType::Ios.is_mobile());
        assert!(!ClientType::Mac.is_mobile());
    }

    #[tokio::test]
    async fn ids_start_at_one_and_increase() {
        let registry = SessionRegistry::new();

        let a = registry.open(&conn(1)).await;
        let b = registry.open(&conn(2)).await;

        assert_eq!(a.id(), SessionId::new(1));
        assert_eq!(b.id(), SessionId::new(2));
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn opening_same_connection_twice_reuses_session() {
        let registry = SessionRegistry::new();
        let c = conn(1);

        let a = registry.open(&c).await;
        let b = registry.open(&c).await;

        assert_eq!(a.id(), b.id());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn close_connection_removes_from_every_index() {
        let registry = SessionRegistry::new();
        let c = conn(1);
        let session = registry.open(&c).await;
        registry.authenticate(session.id(), 7, ClientType::Pc).await.unwrap();

        let removed = registry.close_connection(&c).await.unwrap();

        assert_eq!(removed.id(), session.id());
        assert!(c.is_closed());
        assert!(registry.is_empty().await);
        assert_eq!(registry.user_count().await, 0);
        assert!(registry.session_for_connection(&c).await.is_none());
        assert!(registry.close_connection(&c).await.is_none());
    }

    #[tokio::test]
    async fn authenticate_rejects_bad_input() {
        let registry = SessionRegistry::new();
        let session = registry.open(&conn(1)).await;

        assert_eq!(
            registry.authenticate(session.id(), 0, ClientType::Pc).await.unwrap_err(),
            SessionError::InvalidUserId
        );
        assert_eq!(
            registry.authenticate(SessionId::new(99), 1, ClientType::Pc).await.unwrap_err(),
            SessionError::NotFound(SessionId::new(99))
        );
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn reauthenticating_keeps_bucket_position() {
        let registry = SessionRegistry::new();
        let first = registry.open(&conn(1)).await;
        let second = registry.open(&conn(2)).await;

        registry.authenticate(first.id(), 5, ClientType::Pc).await.unwrap();
        registry.authenticate(second.id(), 5, ClientType::Android).await.unwrap();
        registry.authenticate(first.id(), 5, ClientType::Mac).await.unwrap();

        let ids: Vec<_> = registry.sessions_for_user(5).await.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![first.id(), second.id()]);
        assert_eq!(registry.user_client_type(5).await, ClientType::Mac);
    }

    #[tokio::test]
    async fn switching_user_moves_session() {
        let registry = SessionRegistry::new();
        let session = registry.open(&conn(1)).await;

        registry.authenticate(session.id(), 5, ClientType::Pc).await.unwrap();
        registry.authenticate(session.id(), 6, ClientType::Pc).await.unwrap();

        assert!(registry.sessions_for_user(5).await.is_empty());
        assert_eq!(registry.sessions_for_user(6).await.len(), 1);
        assert_eq!(registry.user_ids().await, vec![6]);
    }

    #[tokio::test]
    async fn pc_and_mobile_sessions_for_one_user() {
        let registry = SessionRegistry::new();
        let pc = registry.open(&conn(1)).await;
        let phone = registry.open(&conn(2)).await;

        registry.authenticate(pc.id(), 100, ClientType::Pc).await.unwrap();
        registry.authenticate(phone.id(), 100, ClientType::Android).await.unwrap();

        let found = registry.session_for_user_and_client_type(100, ClientType::Pc).await.unwrap();
        assert_eq!(found.id(), pc.id());

        let found = registry.session_for_user_and_client_type(100, ClientType::Android).await;
        assert_eq!(found.map(|s| s.id()), Some(phone.id()));

        assert!(registry.session_for_user_and_client_type(100, ClientType::Ios).await.is_none());
        assert_eq!(registry.sessions_for_user(100).await.len(), 2);
        assert_eq!(registry.user_count().await, 1);
    }

    #[tokio::test]
    async fn user_snapshot_is_independent() {
        let registry = SessionRegistry::new();
        let c = conn(1);
        let session = registry.open(&c).await;
        registry.authenticate(session.id(), 3, ClientType::Ios).await.unwrap();

        let snapshot = registry.sessions_for_user(3).await;
        registry.close_connection(&c).await;

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), session.id());
        assert!(registry.sessions_for_user(3).await.is_empty());
    }

    #[tokio::test]
    async fn user_status_reads_first_session() {
        let registry = SessionRegistry::new();
        let first = registry.open(&conn(1)).await;
        let second = registry.open(&conn(2)).await;

        registry.authenticate(first.id(), 9, ClientType::Pc).await.unwrap();
        registry.authenticate(second.id(), 9, ClientType::Ios).await.unwrap();
        first.set_status(1);
        second.set_status(2);

        assert_eq!(registry.user_status(9).await, 1);
        assert_eq!(registry.user_client_type(9).await, ClientType::Pc);
        assert_eq!(registry.user_status(10).await, 0);
        assert_eq!(registry.user_client_type(10).await, ClientType::Unknown);

        registry.remove(first.id()).await.unwrap();
        assert_eq!(registry.user_status(9).await, 2);
        assert_eq!(registry.user_client_type(9).await, ClientType::Ios);
    }

    #[tokio::test]
    async fn profile_starts_empty_and_is_replaceable() {
        let registry = SessionRegistry::new();
        let session = registry.open(&conn(1)).await;
        assert_eq!(session.profile(), Profile::default());

        session.set_profile(Profile {
            username: "alice".to_string(),
            nickname: "Al".to_string(),
        });

        let found = registry.session(session.id()).await.unwrap();
        assert_eq!(found.username(), "alice");
        assert_eq!(found.nickname(), "Al");
    }

    #[tokio::test]
    async fn broadcast_reports_each_session() {
        let registry = SessionRegistry::new();
        let (live, mut live_peer) = detached("Chat", 1);
        let (dead, _dead_peer) = detached("Chat", 2);
        let (other, _other_peer) = detached("Chat", 3);

        let a = registry.open(&live).await;
        let b = registry.open(&dead).await;
        let c = registry.open(&other).await;
        registry.authenticate(a.id(), 1, ClientType::Pc).await.unwrap();
        registry.authenticate(b.id(), 1, ClientType::Android).await.unwrap();
        registry.authenticate(c.id(), 2, ClientType::Pc).await.unwrap();
        dead.close();

        let report = registry.broadcast(BroadcastTarget::User(1), b"hi").await;
        assert_eq!(report, BroadcastReport { delivered: 1, closed: 1, failed: 0 });

        let mut buf = [0u8; 2];
        live_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        let report = registry.broadcast(BroadcastTarget::All, b"all").await;
        assert_eq!(report.attempted(), 3);
        assert_eq!(report.delivered, 2);
    }

    #[tokio::test]
    async fn clear_closes_everything() {
        let registry = SessionRegistry::new();
        let c1 = conn(1);
        let c2 = conn(2);
        let s1 = registry.open(&c1).await;
        registry.open(&c2).await;
        registry.authenticate(s1.id(), 4, ClientType::Pc).await.unwrap();

        assert_eq!(registry.clear().await, 2);

        assert!(c1.is_closed() && c2.is_closed());
        assert!(registry.is_empty().await);
        assert_eq!(registry.user_count().await, 0);

        let next = registry.open(&conn(3)).await;
        assert_eq!(next.id(), SessionId::new(3));
    }
}
