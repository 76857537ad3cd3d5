//! Data-access collaborator for worker tasks.
//!
//! The worker pool dispatches every task to a [`DataStore`]. The trait is
//! synchronous on purpose: implementations wrap blocking clients (a SQL
//! driver, say), and the pool runs them on tokio's blocking thread pool so
//! they never stall connection I/O.
//!
//! No schema is defined here. Statements are opaque text plus arguments; what
//! they mean is between the service and its store.

mod error;
mod memory;

use std::fmt;

pub use error::StoreError;
pub use memory::MemoryStore;

/// A single argument or column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL / absent
    Null,
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    UInt(u64),
    /// Floating point
    Float(f64),
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Bytes(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// One result row.
pub type Row = Vec<Value>;

/// Statement text plus positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// Statement text, passed to the store verbatim
    pub sql: String,
    /// Positional arguments
    pub args: Vec<Value>,
}

impl Statement {
    /// Statement with no arguments.
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into(), args: Vec::new() }
    }

    /// Statement with positional arguments.
    pub fn with_args(sql: impl Into<String>, args: Vec<Value>) -> Self {
        Self { sql: sql.into(), args }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

/// Outcome of a data-modifying statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecSummary {
    /// Rows changed by the statement
    pub rows_affected: u64,
    /// Generated key, if the store assigns one
    pub last_insert_id: Option<u64>,
}

/// Blocking data-access backend used by the worker pool.
///
/// Must be Clone (every worker holds one), Send + Sync, and is called from
/// blocking threads. Implementations typically share state through `Arc`, so
/// clones see the same backend.
pub trait DataStore: Clone + Send + Sync + 'static {
    /// Run a read-only statement and return its rows.
    fn query(&self, statement: &Statement) -> Result<Vec<Row>, StoreError>;

    /// Run a data-modifying statement.
    fn exec(&self, statement: &Statement) -> Result<ExecSummary, StoreError>;

    /// Run statements atomically: either every one applies or none does.
    fn transaction(&self, statements: &[Statement]) -> Result<Vec<ExecSummary>, StoreError>;
}
