//! Tasks and the bounded task queue.
//!
//! A [`Task`] is one blocking data-store operation plus the callback that
//! receives its result. Tasks travel through a [`TaskQueue`]: a fixed-capacity
//! FIFO that services submit to and workers drain.
//!
//! # Backpressure
//!
//! A full queue never drops work silently. `try_submit` fails immediately,
//! `submit_timeout` waits up to a deadline; either way the caller gets the
//! task back inside a [`SubmitError`] and the rejection is counted in
//! [`QueueStats`].
//!
//! # State machine
//!
//! ```text
//! ┌──────┐  close()  ┌────────┐
//! │ Open │──────────>│ Closed │   submits rejected, take() drains then None
//! └──────┘           └────────┘
//! ```

use std::{
    fmt,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use thiserror::Error;
use tokio::sync::{Mutex, RwLock, mpsc};

use crate::store::{ExecSummary, Row, Statement, StoreError};

/// Default time `submit()` waits for queue space.
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Operation kind, for logging and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Read-only statement returning rows
    Query,
    /// Single data-modifying statement
    Exec,
    /// Several statements applied atomically
    Transaction,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query => f.write_str("query"),
            Self::Exec => f.write_str("exec"),
            Self::Transaction => f.write_str("transaction"),
        }
    }
}

/// What a task asks the data store to do.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOp {
    /// Run a query
    Query(Statement),
    /// Run one data-modifying statement
    Exec(Statement),
    /// Run statements atomically
    Transaction(Vec<Statement>),
}

impl TaskOp {
    /// Discriminant of this operation.
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Query(_) => TaskKind::Query,
            Self::Exec(_) => TaskKind::Exec,
            Self::Transaction(_) => TaskKind::Transaction,
        }
    }
}

/// Successful task result.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    /// Rows returned by a query
    Rows(Vec<Row>),
    /// Summary of an exec
    Executed(ExecSummary),
    /// One summary per statement of a committed transaction
    Committed(Vec<ExecSummary>),
}

/// Failed task result, handed to the task's callback. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Data store returned an error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Data store panicked while executing the task.
    ///
    /// Only this task is affected; the worker keeps running.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// Pool stopped before any worker picked the task up.
    #[error("task cancelled: worker pool stopped before it ran")]
    Cancelled,
}

/// Completion callback. Runs once, on a worker task; must not block.
pub type TaskCallback = Box<dyn FnOnce(Result<TaskOutput, TaskError>) + Send + 'static>;

/// A unit of work for the worker pool.
pub struct Task {
    op: TaskOp,
    callback: TaskCallback,
}

impl Task {
    /// Task running `op`, reporting to `callback`.
    pub fn new<F>(op: TaskOp, callback: F) -> Self
    where
        F: FnOnce(Result<TaskOutput, TaskError>) + Send + 'static,
    {
        Self { op, callback: Box::new(callback) }
    }

    /// Query task.
    pub fn query<F>(statement: Statement, callback: F) -> Self
    where
        F: FnOnce(Result<TaskOutput, TaskError>) + Send + 'static,
    {
        Self::new(TaskOp::Query(statement), callback)
    }

    /// Exec task.
    pub fn exec<F>(statement: Statement, callback: F) -> Self
    where
        F: FnOnce(Result<TaskOutput, TaskError>) + Send + 'static,
    {
        Self::new(TaskOp::Exec(statement), callback)
    }

    /// Transaction task.
    pub fn transaction<F>(statements: Vec<Statement>, callback: F) -> Self
    where
        F: FnOnce(Result<TaskOutput, TaskError>) + Send + 'static,
    {
        Self::new(TaskOp::Transaction(statements), callback)
    }

    /// Operation kind.
    pub fn kind(&self) -> TaskKind {
        self.op.kind()
    }

    /// Operation this task runs.
    pub fn op(&self) -> &TaskOp {
        &self.op
    }

    /// Split into operation and callback.
    pub fn into_parts(self) -> (TaskOp, TaskCallback) {
        (self.op, self.callback)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("op", &self.op).finish_non_exhaustive()
    }
}

/// Why a task was not enqueued. Carries the task back to the caller.
#[derive(Error, Debug)]
pub enum SubmitError {
    /// Queue was full and the caller asked not to wait.
    #[error("task queue full")]
    Full(Task),

    /// Queue stayed full for the whole submit timeout.
    #[error("task queue still full after {timeout:?}")]
    Timeout {
        /// The rejected task
        task: Task,
        /// How long the caller waited
        timeout: Duration,
    },

    /// Queue is closed; no task will ever be accepted again.
    #[error("task queue closed")]
    Closed(Task),
}

impl SubmitError {
    /// Recover the rejected task.
    pub fn into_task(self) -> Task {
        match self {
            Self::Full(task) | Self::Timeout { task, .. } | Self::Closed(task) => task,
        }
    }
}

/// Counters for queue traffic. Monotonic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Tasks accepted into the queue
    pub accepted: u64,
    /// Rejected by `try_submit` because the queue was full
    pub rejected_full: u64,
    /// Rejected because the submit timeout elapsed
    pub rejected_timeout: u64,
    /// Rejected because the queue was closed
    pub rejected_closed: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    rejected_full: AtomicU64,
    rejected_timeout: AtomicU64,
    rejected_closed: AtomicU64,
}

/// Bounded, closable FIFO of tasks shared by submitters and workers.
///
/// Built on a bounded `mpsc` channel. The sender lives behind a read/write
/// lock: submits hold it shared, `close()` takes it exclusively and drops
/// the sender. Once every buffered task has been taken, `take()` returns
/// `None`.
pub struct TaskQueue {
    sender: RwLock<Option<mpsc::Sender<Task>>>,
    receiver: Mutex<mpsc::Receiver<Task>>,
    capacity: usize,
    len: AtomicUsize,
    submit_timeout: Duration,
    counters: Counters,
}

impl TaskQueue {
    /// Queue holding at most `capacity` tasks (at least 1), with the default
    /// submit timeout.
    pub fn new(capacity: usize) -> Self {
        Self::with_submit_timeout(capacity, DEFAULT_SUBMIT_TIMEOUT)
    }

    /// Queue with an explicit timeout for [`TaskQueue::submit`].
    pub fn with_submit_timeout(capacity: usize, submit_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);

        Self {
            sender: RwLock::new(Some(tx)),
            receiver: Mutex::new(rx),
            capacity,
            len: AtomicUsize::new(0),
            submit_timeout,
            counters: Counters::default(),
        }
    }

    /// Enqueue without waiting.
    pub async fn try_submit(&self, task: Task) -> Result<(), SubmitError> {
        let sender = self.sender.read().await;
        let Some(tx) = sender.as_ref() else {
            return Err(self.rejected_closed(task));
        };

        match tx.try_reserve() {
            Ok(permit) => {
                self.len.fetch_add(1, Ordering::AcqRel);
                permit.send(task);
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            Err(mpsc::error::TrySendError::Full(())) => {
                self.counters.rejected_full.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(kind = %task.kind(), capacity = self.capacity, "task queue full");
                Err(SubmitError::Full(task))
            },
            Err(mpsc::error::TrySendError::Closed(())) => Err(self.rejected_closed(task)),
        }
    }

    /// Enqueue, waiting up to `timeout` for space.
    pub async fn submit_timeout(&self, task: Task, timeout: Duration) -> Result<(), SubmitError> {
        let sender = self.sender.read().await;
        let Some(tx) = sender.as_ref() else {
            return Err(self.rejected_closed(task));
        };

        // len counts buffered tasks only, not waiting submitters
        match tokio::time::timeout(timeout, tx.reserve()).await {
            Ok(Ok(permit)) => {
                self.len.fetch_add(1, Ordering::AcqRel);
                permit.send(task);
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            Ok(Err(_)) => Err(self.rejected_closed(task)),
            Err(_) => {
                self.counters.rejected_timeout.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    kind = %task.kind(),
                    capacity = self.capacity,
                    ?timeout,
                    "task queue full, submit timed out"
                );
                Err(SubmitError::Timeout { task, timeout })
            },
        }
    }

    /// Enqueue, waiting up to the queue's default submit timeout.
    pub async fn submit(&self, task: Task) -> Result<(), SubmitError> {
        self.submit_timeout(task, self.submit_timeout).await
    }

    /// Next task in FIFO order.
    ///
    /// Waits while the queue is open and empty. Returns `None` once the queue
    /// is closed and fully drained.
    pub async fn take(&self) -> Option<Task> {
        let task = self.receiver.lock().await.recv().await?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(task)
    }

    /// Stop accepting tasks. Idempotent.
    ///
    /// Waits for submits already in flight to finish (bounded by their
    /// timeouts). Buffered tasks stay available to `take()`.
    pub async fn close(&self) {
        if self.sender.write().await.take().is_some() {
            tracing::debug!(pending = self.len(), "task queue closed");
        }
    }

    /// Whether `close()` has run.
    pub async fn is_closed(&self) -> bool {
        self.sender.read().await.is_none()
    }

    /// Tasks currently buffered.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// True when no task is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of buffered tasks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the traffic counters.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            rejected_full: self.counters.rejected_full.load(Ordering::Relaxed),
            rejected_timeout: self.counters.rejected_timeout.load(Ordering::Relaxed),
            rejected_closed: self.counters.rejected_closed.load(Ordering::Relaxed),
        }
    }

    fn rejected_closed(&self, task: Task) -> SubmitError {
        self.counters.rejected_closed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(kind = %task.kind(), "task submitted to closed queue");
        SubmitError::Closed(task)
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn noop_task(sql: &str) -> Task {
        Task::exec(Statement::new(sql), |_| {})
    }

    #[tokio::test]
    async fn tasks_come_out_in_fifo_order() {
        let queue = TaskQueue::new(4);
        for sql in ["a", "b", "c"] {
            queue.try_submit(noop_task(sql)).await.unwrap();
        }

        for sql in ["a", "b", "c"] {
            let task = queue.take().await.unwrap();
            assert_eq!(task.op(), &TaskOp::Exec(Statement::new(sql)));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn try_submit_on_full_queue_returns_task() {
        let queue = TaskQueue::new(2);
        queue.try_submit(noop_task("a")).await.unwrap();
        queue.try_submit(noop_task("b")).await.unwrap();

        let err = queue.try_submit(noop_task("c")).await.unwrap_err();
        assert!(matches!(err, SubmitError::Full(_)));
        assert_eq!(err.into_task().op(), &TaskOp::Exec(Statement::new("c")));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.stats().rejected_full, 1);
        assert_eq!(queue.stats().accepted, 2);
    }

    #[tokio::test]
    async fn submit_times_out_when_nobody_drains() {
        let queue = TaskQueue::new(1);
        queue.submit(noop_task("a")).await.unwrap();

        let err = queue.submit_timeout(noop_task("b"), Duration::from_millis(20)).await;
        assert!(matches!(err, Err(SubmitError::Timeout { .. })));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.stats().rejected_timeout, 1);
    }

    #[tokio::test]
    async fn submit_waits_for_space() {
        let queue = Arc::new(TaskQueue::new(1));
        queue.submit(noop_task("a")).await.unwrap();

        let drainer = Arc::clone(&queue);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drainer.take().await.map(|t| t.op().clone())
        });

        queue.submit_timeout(noop_task("b"), Duration::from_secs(5)).await.unwrap();
        assert_eq!(handle.await.unwrap(), Some(TaskOp::Exec(Statement::new("a"))));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn closed_queue_rejects_and_drains() {
        let queue = TaskQueue::new(4);
        queue.submit(noop_task("a")).await.unwrap();
        queue.submit(noop_task("b")).await.unwrap();

        queue.close().await;
        queue.close().await;
        assert!(queue.is_closed().await);

        assert!(matches!(queue.submit(noop_task("c")).await, Err(SubmitError::Closed(_))));
        assert!(matches!(queue.try_submit(noop_task("d")).await, Err(SubmitError::Closed(_))));
        assert_eq!(queue.stats().rejected_closed, 2);

        assert!(queue.take().await.is_some());
        assert!(queue.take().await.is_some());
        assert!(queue.take().await.is_none());
        assert!(queue.take().await.is_none());
    }

    #[tokio::test]
    async fn close_wakes_idle_taker() {
        let queue = Arc::new(TaskQueue::new(2));

        let taker = Arc::clone(&queue);
        let handle = tokio::spawn(async move { taker.take().await.is_none() });

        tokio::task::yield_now().await;
        queue.close().await;

        let exhausted = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap();
        assert!(exhausted.unwrap());
    }

    #[tokio::test]
    async fn zero_capacity_is_clamped() {
        let queue = TaskQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.try_submit(noop_task("a")).await.unwrap();
    }

    #[test]
    fn task_kind_follows_op() {
        assert_eq!(Task::query(Statement::new("q"), |_| {}).kind(), TaskKind::Query);
        assert_eq!(noop_task("e").kind(), TaskKind::Exec);
        assert_eq!(Task::transaction(vec![], |_| {}).kind(), TaskKind::Transaction);
        assert_eq!(TaskKind::Transaction.to_string(), "transaction");
    }
}
