#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use super::{DataStore, ExecSummary, Row, Statement, StoreError};

/// In-memory data store for tests and local runs.
///
/// Queries are answered from canned rows registered per statement text with
/// [`MemoryStore::set_rows`]. Data-modifying statements are appended to a
/// journal and get sequential insert ids. Failures can be injected per
/// statement text, and the whole store can be marked unavailable to mimic a
/// lost backend connection.
///
/// All state sits behind one `Arc<Mutex<_>>`, so clones share it. A poisoned
/// mutex is reported as [`StoreError::Unavailable`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Statement text → rows returned by `query`
    canned: HashMap<String, Vec<Row>>,
    /// Statements applied by `exec` / `transaction`, in order
    journal: Vec<Statement>,
    /// Statement texts that fail with `Rejected`
    failing: HashSet<String>,
    unavailable: bool,
}

impl MemoryStore {
    /// Create an empty, available store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the rows `query` returns for `sql`.
    pub fn set_rows(&self, sql: impl Into<String>, rows: Vec<Row>) -> Result<(), StoreError> {
        self.lock_any()?.canned.insert(sql.into(), rows);
        Ok(())
    }

    /// Make every statement with this text fail with [`StoreError::Rejected`].
    pub fn fail_on(&self, sql: impl Into<String>) -> Result<(), StoreError> {
        self.lock_any()?.failing.insert(sql.into());
        Ok(())
    }

    /// Toggle availability. While unavailable every call fails.
    pub fn set_available(&self, available: bool) -> Result<(), StoreError> {
        self.lock_any()?.unavailable = !available;
        Ok(())
    }

    /// Statements applied so far, in order.
    pub fn journal(&self) -> Result<Vec<Statement>, StoreError> {
        Ok(self.lock_any()?.journal.clone())
    }

    /// Lock without checking availability.
    fn lock_any(&self) -> Result<MutexGuard<'_, MemoryStoreInner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Unavailable)
    }

    /// Lock and fail if the store is marked unavailable.
    fn lock(&self) -> Result<MutexGuard<'_, MemoryStoreInner>, StoreError> {
        let inner = self.lock_any()?;
        if inner.unavailable {
            return Err(StoreError::Unavailable);
        }
        Ok(inner)
    }
}

impl MemoryStoreInner {
    fn check(&self, statement: &Statement) -> Result<(), StoreError> {
        if self.failing.contains(&statement.sql) {
            return Err(StoreError::Rejected {
                sql: statement.sql.clone(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn apply(&mut self, statement: &Statement) -> ExecSummary {
        self.journal.push(statement.clone());
        ExecSummary { rows_affected: 1, last_insert_id: Some(self.journal.len() as u64) }
    }
}

impl DataStore for MemoryStore {
    fn query(&self, statement: &Statement) -> Result<Vec<Row>, StoreError> {
        let inner = self.lock()?;
        inner.check(statement)?;

        inner
            .canned
            .get(&statement.sql)
            .cloned()
            .ok_or_else(|| StoreError::UnknownQuery(statement.sql.clone()))
    }

    fn exec(&self, statement: &Statement) -> Result<ExecSummary, StoreError> {
        let mut inner = self.lock()?;
        inner.check(statement)?;

        Ok(inner.apply(statement))
    }

    fn transaction(&self, statements: &[Statement]) -> Result<Vec<ExecSummary>, StoreError> {
        let mut inner = self.lock()?;

        // Validate everything first so a failure leaves the journal untouched
        for statement in statements {
            inner.check(statement)?;
        }

        Ok(statements.iter().map(|s| inner.apply(s)).collect())
    }
}
