//! Resolved host/port pairs.

use std::{
    fmt,
    net::{IpAddr, SocketAddr, ToSocketAddrs},
};

use crate::error::NetError;

/// An immutable, already-resolved network address.
///
/// Keeps the host string the caller asked for next to the socket address it
/// resolved to, so logs can show both. Resolution happens exactly once, at
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    host: String,
    port: u16,
    resolved: SocketAddr,
}

impl Address {
    /// Resolve `host:port` into an address.
    ///
    /// Uses the first address the system resolver returns. Fails with
    /// [`NetError::Resolution`] if the pair cannot be resolved.
    pub fn resolve(host: impl Into<String>, port: u16) -> Result<Self, NetError> {
        let host = host.into();

        let resolved = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| NetError::Resolution { host: host.clone(), port, reason: e.to_string() })?
            .next()
            .ok_or_else(|| NetError::Resolution {
                host: host.clone(),
                port,
                reason: "no addresses returned".to_string(),
            })?;

        Ok(Self { host, port, resolved })
    }

    /// Wrap an address that is already resolved (e.g. an accepted peer).
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self { host: addr.ip().to_string(), port: addr.port(), resolved: addr }
    }

    /// Host string as given at construction.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolved IP address.
    pub fn ip(&self) -> IpAddr {
        self.resolved.ip()
    }

    /// Resolved socket address, suitable for bind/connect.
    pub fn socket_addr(&self) -> SocketAddr {
        self.resolved
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.resolved)
    }
}
