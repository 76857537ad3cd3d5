//! Worker pool draining a [`TaskQueue`] into a [`DataStore`].
//!
//! Each worker is a tokio task looping on [`TaskQueue::take`]. The store call
//! itself is blocking, so it runs under `spawn_blocking`; a slow statement
//! ties up one blocking thread, never the connection I/O.

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{sync::Mutex, task::JoinHandle};

use crate::{
    store::DataStore,
    task::{
        DEFAULT_SUBMIT_TIMEOUT, Task, TaskCallback, TaskError, TaskOp, TaskOutput, TaskQueue,
    },
};

/// Worker pool settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Maximum tasks buffered in the queue
    pub queue_capacity: usize,
    /// How long `submit()` waits for space before rejecting
    pub submit_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { queue_capacity: 1024, submit_timeout: DEFAULT_SUBMIT_TIMEOUT }
    }
}

/// Task outcome counters. Monotonic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Tasks whose callback received `Ok`
    pub completed: u64,
    /// Tasks whose callback received `Err`
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
}

enum PoolState {
    Idle,
    Running(Vec<JoinHandle<()>>),
    Stopped,
}

/// Fixed set of workers sharing one task queue and one data store.
///
/// Lifecycle is `Idle → Running → Stopped`. Stopping closes the queue,
/// lets the workers drain what is buffered, and waits for them to exit.
pub struct WorkerPool<S: DataStore> {
    store: S,
    queue: Arc<TaskQueue>,
    counters: Arc<Counters>,
    state: Mutex<PoolState>,
}

impl<S: DataStore> WorkerPool<S> {
    /// Create a pool over `store`. No workers run until [`WorkerPool::start`].
    pub fn new(store: S, config: WorkerPoolConfig) -> Self {
        Self {
            store,
            queue: Arc::new(TaskQueue::with_submit_timeout(
                config.queue_capacity,
                config.submit_timeout,
            )),
            counters: Arc::new(Counters::default()),
            state: Mutex::new(PoolState::Idle),
        }
    }

    /// Spawn `workers` worker loops (at least one).
    ///
    /// No-op if already running. After [`WorkerPool::stop`] the pool cannot be
    /// restarted; the call is logged and ignored.
    pub async fn start(&self, workers: usize) {
        let mut state = self.state.lock().await;
        match &*state {
            PoolState::Running(_) => return,
            PoolState::Stopped => {
                tracing::warn!("worker pool already stopped, ignoring start");
                return;
            },
            PoolState::Idle => {},
        }

        let workers = workers.max(1);
        let handles = (1..=workers)
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    Arc::clone(&self.queue),
                    self.store.clone(),
                    Arc::clone(&self.counters),
                ))
            })
            .collect();

        *state = PoolState::Running(handles);
        tracing::info!(workers, capacity = self.queue.capacity(), "worker pool started");
    }

    /// Close the queue and wait for every worker to drain it and exit.
    ///
    /// Idempotent. Tasks already buffered still run; new submissions are
    /// rejected with [`crate::SubmitError::Closed`]. If the pool never
    /// started, buffered tasks are failed with [`TaskError::Cancelled`].
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, PoolState::Stopped);

        match previous {
            PoolState::Stopped => {},
            PoolState::Idle => {
                self.queue.close().await;

                let pending = self.queue.len();
                while let Some(task) = self.queue.take().await {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    let (_, callback) = task.into_parts();
                    invoke(0, callback, Err(TaskError::Cancelled));
                }
                tracing::info!(pending, "worker pool stopped before start, tasks cancelled");
            },
            PoolState::Running(handles) => {
                self.queue.close().await;
                for handle in handles {
                    if let Err(e) = handle.await {
                        tracing::error!(error = %e, "worker exited abnormally");
                    }
                }
                tracing::info!(stats = ?self.stats(), "worker pool stopped");
            },
        }
    }

    /// Whether workers are running.
    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, PoolState::Running(_))
    }

    /// Queue handle for submitters.
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Submit with the queue's default timeout. Shorthand for
    /// `pool.queue().submit(task)`.
    pub async fn submit(&self, task: Task) -> Result<(), crate::SubmitError> {
        self.queue.submit(task).await
    }

    /// Task outcome counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker<S: DataStore>(
    id: usize,
    queue: Arc<TaskQueue>,
    store: S,
    counters: Arc<Counters>,
) {
    tracing::debug!(worker = id, "worker started");

    while let Some(task) = queue.take().await {
        let kind = task.kind();
        let (op, callback) = task.into_parts();
        let store = store.clone();

        let result = match tokio::task::spawn_blocking(move || execute(&store, op)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(TaskError::Panicked(panic_message(e.into_panic()))),
            Err(e) => Err(TaskError::Panicked(e.to_string())),
        };

        match &result {
            Ok(_) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
            },
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(worker = id, %kind, error = %e, "task failed");
            },
        }

        invoke(id, callback, result);
    }

    tracing::debug!(worker = id, "worker stopped");
}

/// Run a task callback. A panicking callback is logged; the worker survives.
fn invoke(worker: usize, callback: TaskCallback, result: Result<TaskOutput, TaskError>) {
    if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(move || callback(result))) {
        tracing::error!(worker, panic = %panic_message(payload), "task callback panicked");
    }
}

fn execute<S: DataStore>(store: &S, op: TaskOp) -> Result<TaskOutput, TaskError> {
    match op {
        TaskOp::Query(statement) => Ok(TaskOutput::Rows(store.query(&statement)?)),
        TaskOp::Exec(statement) => Ok(TaskOutput::Executed(store.exec(&statement)?)),
        TaskOp::Transaction(statements) => {
            Ok(TaskOutput::Committed(store.transaction(&statements)?))
        },
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        SubmitError,
        store::{ExecSummary, MemoryStore, Row, Statement, StoreError, Value},
    };

    type Results = mpsc::UnboundedReceiver<Result<TaskOutput, TaskError>>;

    fn reporting(
        tx: &mpsc::UnboundedSender<Result<TaskOutput, TaskError>>,
    ) -> impl FnOnce(Result<TaskOutput, TaskError>) + Send + 'static {
        let tx = tx.clone();
        move |result| {
            let _ = tx.send(result);
        }
    }

    async fn next(results: &mut Results) -> Result<TaskOutput, TaskError> {
        tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .expect("callback not invoked in time")
            .expect("results channel closed")
    }

    #[derive(Clone)]
    struct PanickingStore;

    impl DataStore for PanickingStore {
        fn query(&self, _: &Statement) -> Result<Vec<Row>, StoreError> {
            panic!("driver exploded");
        }

        fn exec(&self, _: &Statement) -> Result<ExecSummary, StoreError> {
            Ok(ExecSummary { rows_affected: 0, last_insert_id: None })
        }

        fn transaction(&self, _: &[Statement]) -> Result<Vec<ExecSummary>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn query_result_reaches_callback() {
        let store = MemoryStore::new();
        store.set_rows("SELECT name FROM users", vec![vec![Value::from("alice")]]).unwrap();

        let pool = WorkerPool::new(store, WorkerPoolConfig::default());
        pool.start(2).await;

        let (tx, mut results) = mpsc::unbounded_channel();
        pool.submit(Task::query(Statement::new("SELECT name FROM users"), reporting(&tx)))
            .await
            .unwrap();

        let rows = next(&mut results).await.unwrap();
        assert_eq!(rows, TaskOutput::Rows(vec![vec![Value::from("alice")]]));

        pool.stop().await;
        assert_eq!(pool.stats(), PoolStats { completed: 1, failed: 0 });
    }

    #[tokio::test]
    async fn store_error_reaches_callback_without_retry() {
        let store = MemoryStore::new();
        store.fail_on("INSERT bad").unwrap();

        let pool = WorkerPool::new(store.clone(), WorkerPoolConfig::default());
        pool.start(1).await;

        let (tx, mut results) = mpsc::unbounded_channel();
        pool.submit(Task::exec(Statement::new("INSERT bad"), reporting(&tx))).await.unwrap();

        let err = next(&mut results).await.unwrap_err();
        assert!(matches!(err, TaskError::Store(StoreError::Rejected { .. })));

        pool.stop().await;
        assert!(results.try_recv().is_err());
        assert!(store.journal().unwrap().is_empty());
        assert_eq!(pool.stats().failed, 1);
    }

    #[tokio::test]
    async fn panic_is_isolated_to_its_task() {
        let pool = WorkerPool::new(PanickingStore, WorkerPoolConfig::default());
        pool.start(1).await;

        let (tx, mut results) = mpsc::unbounded_channel();
        pool.submit(Task::query(Statement::new("SELECT 1"), reporting(&tx))).await.unwrap();
        pool.submit(Task::exec(Statement::new("UPDATE x"), reporting(&tx))).await.unwrap();

        let first = next(&mut results).await;
        assert!(matches!(first, Err(TaskError::Panicked(msg)) if msg.contains("driver exploded")));

        let second = next(&mut results).await;
        assert!(matches!(second, Ok(TaskOutput::Executed(_))));

        pool.stop().await;
    }

    #[tokio::test]
    async fn small_queue_with_fast_consumer_loses_nothing() {
        let config =
            WorkerPoolConfig { queue_capacity: 2, submit_timeout: Duration::from_secs(1) };
        let pool = WorkerPool::new(MemoryStore::new(), config);
        pool.start(1).await;

        let (tx, mut results) = mpsc::unbounded_channel();
        for i in 0..3 {
            let statement = Statement::with_args("INSERT INTO t VALUES (?)", vec![Value::from(i)]);
            pool.submit(Task::exec(statement, reporting(&tx))).await.unwrap();
        }

        for _ in 0..3 {
            assert!(matches!(next(&mut results).await, Ok(TaskOutput::Executed(_))));
        }

        pool.stop().await;
        assert_eq!(pool.queue().stats().accepted, 3);
        assert_eq!(pool.stats().completed, 3);
    }

    #[tokio::test]
    async fn stop_drains_buffered_tasks() {
        let store = MemoryStore::new();
        let pool = WorkerPool::new(store.clone(), WorkerPoolConfig::default());

        let (tx, mut results) = mpsc::unbounded_channel();
        for sql in ["INSERT a", "INSERT b", "INSERT c"] {
            pool.queue().try_submit(Task::exec(Statement::new(sql), reporting(&tx))).await.unwrap();
        }

        pool.start(2).await;
        pool.stop().await;

        for _ in 0..3 {
            assert!(next(&mut results).await.is_ok());
        }
        assert_eq!(store.journal().unwrap().len(), 3);
        assert!(pool.queue().is_empty());
    }

    #[tokio::test]
    async fn stopped_pool_rejects_and_stays_stopped() {
        let pool = WorkerPool::new(MemoryStore::new(), WorkerPoolConfig::default());
        pool.start(1).await;
        pool.start(4).await;
        assert!(pool.is_running().await);

        pool.stop().await;
        pool.stop().await;
        assert!(!pool.is_running().await);

        pool.start(1).await;
        assert!(!pool.is_running().await);

        let result = pool.submit(Task::exec(Statement::new("INSERT a"), |_| {})).await;
        assert!(matches!(result, Err(SubmitError::Closed(_))));
    }

    #[tokio::test]
    async fn panicking_callback_does_not_strand_queued_tasks() {
        let pool = WorkerPool::new(MemoryStore::new(), WorkerPoolConfig::default());

        let (tx, mut results) = mpsc::unbounded_channel();
        pool.submit(Task::exec(Statement::new("INSERT boom"), |_| panic!("callback exploded")))
            .await
            .unwrap();
        for sql in ["INSERT a", "INSERT b", "INSERT c"] {
            pool.submit(Task::exec(Statement::new(sql), reporting(&tx))).await.unwrap();
        }

        pool.start(1).await;
        pool.stop().await;

        for _ in 0..3 {
            assert!(next(&mut results).await.is_ok());
        }
        assert!(pool.queue().is_empty());
        assert_eq!(pool.stats().completed, 4);
    }

    #[tokio::test]
    async fn stop_before_start_cancels_buffered_tasks() {
        let store = MemoryStore::new();
        let pool = WorkerPool::new(store.clone(), WorkerPoolConfig::default());

        let (tx, mut results) = mpsc::unbounded_channel();
        pool.submit(Task::exec(Statement::new("INSERT a"), reporting(&tx))).await.unwrap();
        pool.submit(Task::query(Statement::new("SELECT 1"), reporting(&tx))).await.unwrap();

        pool.stop().await;

        for _ in 0..2 {
            assert_eq!(next(&mut results).await, Err(TaskError::Cancelled));
        }
        assert!(pool.queue().is_empty());
        assert!(store.journal().unwrap().is_empty());
        assert_eq!(pool.stats(), PoolStats { completed: 0, failed: 2 });
    }

    #[tokio::test]
    async fn transaction_commits_every_statement() {
        let store = MemoryStore::new();
        let pool = WorkerPool::new(store.clone(), WorkerPoolConfig::default());
        pool.start(1).await;

        let (tx, mut results) = mpsc::unbounded_channel();
        let statements = vec![Statement::new("INSERT a"), Statement::new("INSERT b")];
        pool.submit(Task::transaction(statements, reporting(&tx))).await.unwrap();

        match next(&mut results).await {
            Ok(TaskOutput::Committed(summaries)) => assert_eq!(summaries.len(), 2),
            other => panic!("unexpected result: {other:?}"),
        }

        pool.stop().await;
    }
}
