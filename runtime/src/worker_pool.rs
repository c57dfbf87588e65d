//! Bounded worker pool.
//!
//! A fixed number of persistent workers pull tasks from one bounded queue. Submission
//! applies backpressure: when the queue is full, [`WorkerPool::submit`] waits until a slot
//! frees up, the pool is cancelled, or the pool is stopped.
//!
//! # Lifecycle
//!
//! `new` → `start` → (`submit`)* → `stop`. A stopped pool cannot be restarted.
//! [`WorkerPool::stop`] is an orderly shutdown: it refuses new work, lets the workers
//! drain everything already queued, and returns once they have exited.
//! [`WorkerPool::cancel`] is the abrupt path: workers exit after their current task and
//! queued tasks are dropped.
//!
//! # Example
//!
//! ```rust
//! use pos_resilience_runtime::worker_pool::WorkerPool;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = WorkerPool::new("receipts", 4, 16);
//! pool.start()?;
//!
//! let printed = Arc::new(AtomicUsize::new(0));
//! for _ in 0..10 {
//!     let printed = Arc::clone(&printed);
//!     pool.submit(async move {
//!         printed.fetch_add(1, Ordering::SeqCst);
//!     })
//!     .await?;
//! }
//!
//! pool.stop().await;
//! assert_eq!(printed.load(Ordering::SeqCst), 10);
//! # Ok(())
//! # }
//! ```

use crate::metrics::WorkerPoolMetrics;
use futures::FutureExt;
use parking_lot::Mutex;
use pos_resilience_core::config::WorkerPoolSettings;
use pos_resilience_core::{CancellationToken, PoolError};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

/// Opaque unit of work. Results leave through whatever the task captured.
pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// Fixed-size pool of workers consuming a bounded task queue.
pub struct WorkerPool {
    name: Arc<str>,
    workers: usize,
    queue_size: usize,
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
    lifecycle: Mutex<Lifecycle>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Abrupt cancellation shared by workers and blocked submitters
    cancel: CancellationToken,
    /// Fired when `stop` begins; wakes blocked submitters
    closing: CancellationToken,
    /// Fired when `stop` has joined every worker
    drained: CancellationToken,
    queued: Arc<AtomicUsize>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .field("queue_size", &self.queue_size)
            .field("queue_depth", &self.queue_depth())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Create a pool with `workers` workers and room for `queue_size` waiting tasks.
    ///
    /// Both values are clamped to at least one.
    #[must_use]
    pub fn new(name: impl Into<String>, workers: usize, queue_size: usize) -> Self {
        let workers = workers.max(1);
        let queue_size = queue_size.max(1);
        let (sender, receiver) = mpsc::channel(queue_size);
        Self {
            name: Arc::from(name.into()),
            workers,
            queue_size,
            sender: Mutex::new(Some(sender)),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            lifecycle: Mutex::new(Lifecycle::Created),
            handles: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            closing: CancellationToken::new(),
            drained: CancellationToken::new(),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a pool from configuration.
    #[must_use]
    pub fn from_settings(name: impl Into<String>, settings: &WorkerPoolSettings) -> Self {
        Self::new(name, settings.workers, settings.queue_size)
    }

    /// Spawn the workers. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyStarted` if the pool is running, or
    /// `PoolError::Stopped` if it has been stopped.
    pub fn start(&self) -> Result<(), PoolError> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Running => return Err(PoolError::AlreadyStarted),
            Lifecycle::Stopping | Lifecycle::Stopped => return Err(PoolError::Stopped),
        }

        self.spawn_workers();
        *lifecycle = Lifecycle::Running;

        tracing::info!(
            pool = %self.name,
            workers = self.workers,
            queue_size = self.queue_size,
            "Worker pool started"
        );
        Ok(())
    }

    fn spawn_workers(&self) {
        let mut handles = self.handles.lock();
        for worker_id in 0..self.workers {
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                Arc::clone(&self.name),
                Arc::clone(&self.receiver),
                self.cancel.clone(),
                Arc::clone(&self.queued),
            )));
        }
    }

    /// Enqueue `task`, waiting for queue space if necessary.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Cancelled` if the pool is cancelled while waiting, or
    /// `PoolError::Stopped` if the pool is (or becomes) stopped.
    pub async fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.enqueue(Box::pin(task), None).await
    }

    /// Like [`WorkerPool::submit`], also giving up when `token` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Cancelled` if `token` or the pool is cancelled while waiting,
    /// or `PoolError::Stopped` if the pool is (or becomes) stopped.
    pub async fn submit_with<F>(&self, task: F, token: &CancellationToken) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.enqueue(Box::pin(task), Some(token)).await
    }

    /// Enqueue `task` only if there is room right now.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::QueueFull` if the queue is full, `PoolError::Cancelled` if the
    /// pool is cancelled, or `PoolError::Stopped` if it is stopped.
    pub fn try_submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self.open_sender()?;
        match sender.try_send(Box::pin(task)) {
            Ok(()) => {
                self.accepted();
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(PoolError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(PoolError::Stopped),
        }
    }

    async fn enqueue(&self, task: Task, token: Option<&CancellationToken>) -> Result<(), PoolError> {
        let sender = self.open_sender()?;
        let caller_cancelled = async {
            match token {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let permit = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(PoolError::Cancelled),
            () = caller_cancelled => return Err(PoolError::Cancelled),
            () = self.closing.cancelled() => return Err(PoolError::Stopped),
            permit = sender.reserve() => permit.map_err(|_| PoolError::Stopped)?,
        };
        permit.send(task);
        self.accepted();
        Ok(())
    }

    fn open_sender(&self) -> Result<mpsc::Sender<Task>, PoolError> {
        if self.cancel.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        self.sender.lock().clone().ok_or(PoolError::Stopped)
    }

    fn accepted(&self) {
        let depth = self.queued.fetch_add(1, Ordering::Relaxed) + 1;
        WorkerPoolMetrics::record_submitted(&self.name);
        WorkerPoolMetrics::record_queue_depth(&self.name, depth);
    }

    /// Stop accepting work, drain the queue, and wait for every worker to exit.
    ///
    /// Idempotent: concurrent and repeated calls all return once the pool is drained.
    pub async fn stop(&self) {
        let first = {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Stopping | Lifecycle::Stopped => false,
                Lifecycle::Created => {
                    // Work accepted before `start` still has to run
                    self.spawn_workers();
                    *lifecycle = Lifecycle::Stopping;
                    true
                }
                Lifecycle::Running => {
                    *lifecycle = Lifecycle::Stopping;
                    true
                }
            }
        };
        if !first {
            self.drained.cancelled().await;
            return;
        }

        tracing::info!(pool = %self.name, queued = self.queue_depth(), "Worker pool stopping");
        self.closing.cancel();
        // Workers see the queue close once the last sender is gone
        self.sender.lock().take();

        let handles = std::mem::take(&mut *self.handles.lock());
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::error!(pool = %self.name, error = %e, "Worker exited abnormally");
            }
        }

        if self.cancel.is_cancelled() {
            self.discard_queued().await;
        }

        *self.lifecycle.lock() = Lifecycle::Stopped;
        self.drained.cancel();
        tracing::info!(pool = %self.name, "Worker pool stopped");
    }

    /// Drop tasks left behind by a cancelled pool and zero the depth gauge.
    async fn discard_queued(&self) {
        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut dropped = 0_usize;
        while receiver.try_recv().is_ok() {
            dropped += 1;
        }
        self.queued.store(0, Ordering::Relaxed);
        WorkerPoolMetrics::record_queue_depth(&self.name, 0);
        if dropped > 0 {
            tracing::warn!(pool = %self.name, dropped, "Discarded queued tasks after cancel");
        }
    }

    /// Cancel the pool: workers exit after their current task, blocked submitters get
    /// `PoolError::Cancelled`, and queued tasks are dropped. Follow with
    /// [`WorkerPool::stop`] to wait for the workers.
    pub fn cancel(&self) {
        tracing::warn!(pool = %self.name, queued = self.queue_depth(), "Worker pool cancelled");
        self.cancel.cancel();
    }

    /// Tasks accepted but not yet picked up by a worker.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    /// Number of workers.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Queue capacity.
    #[must_use]
    pub const fn queue_size(&self) -> usize {
        self.queue_size
    }

    /// Pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `stop` has completed.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.lifecycle.lock() == Lifecycle::Stopped
    }
}

async fn worker_loop(
    worker_id: usize,
    pool: Arc<str>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
    cancel: CancellationToken,
    queued: Arc<AtomicUsize>,
) {
    tracing::debug!(pool = %pool, worker_id, "Worker started");
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            task = async { receiver.lock().await.recv().await } => task,
        };
        let Some(task) = next else {
            break;
        };

        let depth = queued.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        WorkerPoolMetrics::record_queue_depth(&pool, depth);

        if AssertUnwindSafe(task).catch_unwind().await.is_ok() {
            WorkerPoolMetrics::record_completed(&pool);
        } else {
            WorkerPoolMetrics::record_panic(&pool);
            tracing::error!(pool = %pool, worker_id, "Task panicked; worker continues");
        }
    }
    tracing::debug!(pool = %pool, worker_id, "Worker exited");
}
