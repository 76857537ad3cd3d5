//! Error types for the network engine.
//!
//! Transport failures are split by where they happen: address resolution and
//! binding are fatal to startup, reads are terminal for one connection, and
//! writes are reported back to the caller. Writing to an already-closed
//! connection is not an error at all; see [`crate::WriteOutcome`].

use std::{io, net::SocketAddr};

use thiserror::Error;

/// Errors produced by [`crate::Address`], [`crate::Connection`] and
/// [`crate::TcpServer`].
#[derive(Error, Debug)]
pub enum NetError {
    /// Host/port pair could not be resolved to a socket address.
    ///
    /// Fatal to startup. Fix the configured host and restart.
    #[error("cannot resolve {host}:{port}: {reason}")]
    Resolution {
        /// Host that failed to resolve
        host: String,
        /// Port that was requested
        port: u16,
        /// Resolver error message
        reason: String,
    },

    /// Listening socket could not be bound.
    ///
    /// Fatal to that server instance (port in use, permission denied).
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// Address we tried to listen on
        address: SocketAddr,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// `start()` was called on a server that is already running or stopped.
    #[error("server {0} already started")]
    AlreadyStarted(String),

    /// Socket read failed.
    ///
    /// Always terminal for the connection; the read loop never retries.
    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    /// Socket write failed.
    ///
    /// The connection is likely broken. Its read loop will observe the
    /// failure and tear the connection down.
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
}

/// Errors produced when decoding from a [`crate::ByteBuffer`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// Not enough readable bytes for the requested value.
    ///
    /// Nothing is consumed when this is returned, so the caller can wait for
    /// more input and retry.
    #[error("buffer underflow: need {needed} bytes, {available} available")]
    Underflow {
        /// Bytes required by the read
        needed: usize,
        /// Bytes currently readable
        available: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_error_display() {
        let err =
            NetError::Resolution { host: "nowhere".to_string(), port: 80, reason: "nope".into() };
        assert_eq!(err.to_string(), "cannot resolve nowhere:80: nope");

        let err = NetError::AlreadyStarted("ChatServer".to_string());
        assert_eq!(err.to_string(), "server ChatServer already started");
    }

    #[test]
    fn buffer_error_display() {
        let err = BufferError::Underflow { needed: 4, available: 1 };
        assert_eq!(err.to_string(), "buffer underflow: need 4 bytes, 1 available");
    }
}
