//! Server-level error types.
//!
//! Queue and task errors live next to the queue in [`crate::task`]; data store
//! errors in [`crate::store`].

use flamingo_net::NetError;
use thiserror::Error;

use crate::session::SessionId;

/// Session registry errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No live session with this id.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// User id 0 is reserved for "not authenticated".
    #[error("invalid user id 0")]
    InvalidUserId,
}

/// Errors from building or running a chat server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network engine error (resolution, bind).
    #[error(transparent)]
    Net(#[from] NetError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_error_display() {
        assert_eq!(
            SessionError::NotFound(SessionId::new(7)).to_string(),
            "session not found: session_7"
        );
        assert_eq!(SessionError::InvalidUserId.to_string(), "invalid user id 0");
    }

    #[test]
    fn server_error_wraps_net_error() {
        let err: ServerError = NetError::AlreadyStarted("Chat".to_string()).into();
        assert!(matches!(err, ServerError::Net(NetError::AlreadyStarted(_))));
    }
}
