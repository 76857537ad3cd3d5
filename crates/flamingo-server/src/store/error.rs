//! Data store error types.

use thiserror::Error;

/// Errors a [`super::DataStore`] can return.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend is not connected or has shut down.
    ///
    /// Transient from the caller's point of view; whether to resubmit is the
    /// service's decision.
    #[error("data store unavailable")]
    Unavailable,

    /// Store has no answer for this query.
    #[error("unknown query: {0}")]
    UnknownQuery(String),

    /// Backend refused the statement (constraint violation, syntax error).
    #[error("statement rejected: {sql}: {reason}")]
    Rejected {
        /// Statement that was rejected
        sql: String,
        /// Backend message
        reason: String,
    },
}
