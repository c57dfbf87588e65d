//! Graceful shutdown coordination.
//!
//! On SIGTERM or Ctrl-C the service stops admitting work and gives each component a
//! bounded grace period to drain: worker pools finish their queues, metrics flush, and
//! so on.
//!
//! ## Architecture
//!
//! - **`ShutdownHandler` trait**: components implement this for cleanup
//! - **`ShutdownCoordinator`**: runs all handlers in parallel, each under a timeout
//! - **`wait_for_signal()`**: waits for SIGTERM or Ctrl-C
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pos_resilience_runtime::shutdown::{wait_for_signal, ShutdownCoordinator};
//! use pos_resilience_runtime::worker_pool::WorkerPool;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = Arc::new(WorkerPool::new("receipts", 4, 64));
//! pool.start()?;
//!
//! let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
//! coordinator.register(Arc::clone(&pool));
//!
//! wait_for_signal().await;
//! if let Err(failures) = coordinator.shutdown().await {
//!     eprintln!("unclean shutdown: {failures:?}");
//! }
//! # Ok(())
//! # }
//! ```

use crate::worker_pool::WorkerPool;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Component that needs an orderly stop.
#[async_trait]
pub trait ShutdownHandler: Send + Sync {
    /// Component name for logging
    fn name(&self) -> &str;

    /// Finish in-flight work and release resources.
    ///
    /// # Errors
    ///
    /// Returns a description of what could not be cleaned up.
    async fn shutdown(&self) -> Result<(), String>;
}

#[async_trait]
impl ShutdownHandler for WorkerPool {
    fn name(&self) -> &str {
        WorkerPool::name(self)
    }

    async fn shutdown(&self) -> Result<(), String> {
        self.stop().await;
        Ok(())
    }
}

#[async_trait]
impl<H: ShutdownHandler + ?Sized> ShutdownHandler for Arc<H> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn shutdown(&self) -> Result<(), String> {
        (**self).shutdown().await
    }
}

/// Coordinates shutdown across components.
///
/// Handlers run in parallel, each bounded by the same timeout. A broadcast goes out
/// first so background loops can stop taking new work.
pub struct ShutdownCoordinator {
    handlers: Vec<Box<dyn ShutdownHandler>>,
    shutdown_tx: broadcast::Sender<()>,
    timeout: Duration,
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("handlers", &self.handlers.iter().map(|h| h.name()).collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ShutdownCoordinator {
    /// Create a coordinator allowing each component `timeout` to stop.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            handlers: Vec::new(),
            shutdown_tx,
            timeout,
        }
    }

    /// Register a shutdown handler
    pub fn register(&mut self, handler: impl ShutdownHandler + 'static) {
        info!(component = handler.name(), "Registered shutdown handler");
        self.handlers.push(Box::new(handler));
    }

    /// Receiver notified when shutdown starts.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Notify subscribers, then stop every handler in parallel.
    ///
    /// # Errors
    ///
    /// Returns one message per component that failed or timed out.
    pub async fn shutdown(&self) -> Result<(), Vec<String>> {
        info!(
            components = self.handlers.len(),
            timeout = ?self.timeout,
            "Initiating graceful shutdown"
        );

        if self.shutdown_tx.send(()).is_err() {
            warn!("No active shutdown signal receivers");
        }

        let results = futures::future::join_all(self.handlers.iter().map(|handler| async move {
            let name = handler.name();
            match tokio::time::timeout(self.timeout, handler.shutdown()).await {
                Ok(Ok(())) => {
                    info!(component = name, "Component shut down");
                    Ok(())
                }
                Ok(Err(e)) => {
                    error!(component = name, error = %e, "Component shutdown failed");
                    Err(format!("{name}: {e}"))
                }
                Err(_) => {
                    error!(component = name, "Component shutdown timed out");
                    Err(format!("{name}: timeout after {:?}", self.timeout))
                }
            }
        }))
        .await;

        let errors: Vec<String> = results.into_iter().filter_map(Result::err).collect();
        if errors.is_empty() {
            info!("All components shut down");
            Ok(())
        } else {
            error!(failures = errors.len(), "Shutdown completed with errors");
            Err(errors)
        }
    }

    /// Get number of registered handlers
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

/// Wait for Ctrl-C, or SIGTERM on Unix.
///
/// If the SIGTERM handler cannot be installed, only Ctrl-C is awaited.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to register SIGTERM handler"),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => error!(error = %e, "Failed to wait for Ctrl+C"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Peripheral that records whether it was asked to stop.
    struct Peripheral {
        name: &'static str,
        jammed: bool,
        stopped: Arc<AtomicBool>,
    }

    fn peripheral(name: &'static str, jammed: bool) -> (Peripheral, Arc<AtomicBool>) {
        let stopped = Arc::new(AtomicBool::new(false));
        let handle = Peripheral {
            name,
            jammed,
            stopped: Arc::clone(&stopped),
        };
        (handle, stopped)
    }

    #[async_trait]
    impl ShutdownHandler for Peripheral {
        fn name(&self) -> &str {
            self.name
        }

        async fn shutdown(&self) -> Result<(), String> {
            self.stopped.store(true, Ordering::SeqCst);
            if self.jammed {
                return Err(format!("{} did not release its port", self.name));
            }
            Ok(())
        }
    }

    /// Never finishes within any reasonable deadline.
    struct StuckSync;

    #[async_trait]
    impl ShutdownHandler for StuckSync {
        fn name(&self) -> &str {
            "offline-sync"
        }

        async fn shutdown(&self) -> Result<(), String> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_every_handler_is_stopped() {
        let (printer, printer_stopped) = peripheral("receipt-printer", false);
        let (reader, reader_stopped) = peripheral("card-reader", false);
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.register(printer);
        coordinator.register(reader);
        assert_eq!(coordinator.handler_count(), 2);

        assert!(coordinator.shutdown().await.is_ok());
        assert!(printer_stopped.load(Ordering::SeqCst));
        assert!(reader_stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_handlers_are_reported_by_name() {
        let (printer, _) = peripheral("receipt-printer", false);
        let (drawer, drawer_stopped) = peripheral("cash-drawer", true);
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.register(printer);
        coordinator.register(drawer);

        let failures = coordinator.shutdown().await.unwrap_err();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("cash-drawer"));
        assert!(drawer_stopped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_handler_hits_the_deadline() {
        let (printer, printer_stopped) = peripheral("receipt-printer", false);
        let mut coordinator = ShutdownCoordinator::new(Duration::from_millis(250));
        coordinator.register(StuckSync);
        coordinator.register(printer);

        let failures = coordinator.shutdown().await.unwrap_err();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("offline-sync"));
        assert!(failures[0].contains("timeout"));
        assert!(printer_stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_subscribers_are_notified() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut rx = coordinator.subscribe();

        let waiter = tokio::spawn(async move { rx.recv().await.is_ok() });
        coordinator.shutdown().await.unwrap();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_worker_pool_drains_on_shutdown() {
        let pool = Arc::new(WorkerPool::new("receipts", 1, 8));
        pool.start().unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let done = Arc::clone(&done);
            pool.submit(async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                done.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }

        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.register(Arc::clone(&pool));
        coordinator.shutdown().await.unwrap();

        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert!(pool.is_stopped());
    }
}
