//! Bulkhead pattern for resource isolation.
//!
//! Named after ship bulkheads that keep water from flooding the whole hull, a bulkhead
//! caps concurrent use of one resource pool (database connections, payment provider,
//! a proxied service) so saturation in one pool cannot starve the others.
//!
//! Admission is fail-fast: when every slot is taken the call is rejected immediately
//! with `BulkheadFull`. There is no wait queue.
//!
//! # Example
//!
//! ```rust
//! use pos_resilience_runtime::bulkhead::Bulkhead;
//! use pos_resilience_core::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bulkhead = Bulkhead::new("database", 20);
//! let token = CancellationToken::new();
//!
//! let rows = bulkhead
//!     .execute(&token, || async { Ok::<_, String>(vec![1, 2, 3]) })
//!     .await?;
//! assert_eq!(rows.len(), 3);
//! # Ok(())
//! # }
//! ```

use crate::metrics::BulkheadMetrics;
use pos_resilience_core::config::BulkheadSettings;
use pos_resilience_core::{CancellationToken, ResilienceError};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Semaphore, TryAcquireError};

/// Bulkhead for isolating resource usage.
///
/// Uses a semaphore to limit concurrent calls. A slot is released when the call returns,
/// fails, panics, or its future is dropped.
#[derive(Debug)]
pub struct Bulkhead {
    name: String,
    semaphore: Semaphore,
    max_concurrency: usize,
}

impl Bulkhead {
    /// Create new bulkhead
    ///
    /// # Arguments
    ///
    /// * `name` - Name for logging and metrics (e.g., "`database`", "`payments`")
    /// * `max_concurrency` - Number of calls allowed in flight at once, capped at
    ///   [`Semaphore::MAX_PERMITS`]
    #[must_use]
    pub fn new(name: impl Into<String>, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.min(Semaphore::MAX_PERMITS);
        Self {
            name: name.into(),
            semaphore: Semaphore::new(max_concurrency),
            max_concurrency,
        }
    }

    /// Execute `f` inside the bulkhead.
    ///
    /// Checks `token` first, then tries to take a slot without waiting.
    ///
    /// # Errors
    ///
    /// Returns:
    /// - `ResilienceError::Cancelled` if `token` is already cancelled
    /// - `ResilienceError::BulkheadFull` if no slot is free
    /// - `ResilienceError::Inner` if `f` fails
    pub async fn execute<F, Fut, T, E>(
        &self,
        token: &CancellationToken,
        f: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if token.is_cancelled() {
            return Err(ResilienceError::Cancelled);
        }

        let permit = match self.semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => {
                BulkheadMetrics::record_rejected(&self.name);
                tracing::warn!(
                    bulkhead = %self.name,
                    max_concurrency = self.max_concurrency,
                    "Bulkhead full, rejecting call"
                );
                return Err(ResilienceError::BulkheadFull {
                    name: self.name.clone(),
                    max_concurrency: self.max_concurrency,
                });
            }
        };

        BulkheadMetrics::record_admitted(&self.name, self.current_concurrency());
        let started = Instant::now();

        let result = f().await;

        // Permit is released on drop, including when this future is dropped mid-call
        drop(permit);
        BulkheadMetrics::record_released(
            &self.name,
            self.current_concurrency(),
            started.elapsed(),
        );

        result.map_err(ResilienceError::Inner)
    }

    /// Number of calls currently holding a slot.
    #[must_use]
    pub fn current_concurrency(&self) -> usize {
        self.max_concurrency
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Get max concurrent calls
    #[must_use]
    pub const fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Get bulkhead name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Bulkhead registry for different resource pools
///
/// Manages multiple bulkheads, one per resource pool.
///
/// # Example
///
/// ```rust
/// use pos_resilience_runtime::bulkhead::{Bulkhead, BulkheadRegistry};
///
/// let mut registry = BulkheadRegistry::new();
/// registry.register(Bulkhead::new("payments", 5));
///
/// let bulkhead = registry.get("payments");
/// assert_eq!(bulkhead.map(|b| b.max_concurrency()), Some(5));
/// ```
#[derive(Debug, Default)]
pub struct BulkheadRegistry {
    bulkheads: BTreeMap<String, Arc<Bulkhead>>,
}

impl BulkheadRegistry {
    /// Create new bulkhead registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// One bulkhead per configured pool.
    #[must_use]
    pub fn from_settings(settings: &BulkheadSettings) -> Self {
        let mut registry = Self::new();
        for (name, capacity) in &settings.pools {
            registry.register(Bulkhead::new(name.clone(), *capacity));
        }
        registry
    }

    /// Register a bulkhead under its own name, replacing any previous one.
    pub fn register(&mut self, bulkhead: Bulkhead) -> Arc<Bulkhead> {
        let bulkhead = Arc::new(bulkhead);
        self.bulkheads
            .insert(bulkhead.name().to_string(), Arc::clone(&bulkhead));
        bulkhead
    }

    /// Get a bulkhead by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Bulkhead>> {
        self.bulkheads.get(name).cloned()
    }

    /// Get a bulkhead by name, creating one with `default_capacity` if missing.
    pub fn get_or_register(&mut self, name: &str, default_capacity: usize) -> Arc<Bulkhead> {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        self.register(Bulkhead::new(name, default_capacity))
    }

    /// Get all bulkhead names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bulkheads.keys().map(String::as_str)
    }

    /// Get number of registered bulkheads
    #[must_use]
    pub fn len(&self) -> usize {
        self.bulkheads.len()
    }

    /// Check if registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bulkheads.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tokio::sync::oneshot;

    async fn exploding_handler() -> Result<(), String> {
        panic!("handler bug")
    }

    #[tokio::test]
    async fn test_admits_within_capacity() {
        let bulkhead = Bulkhead::new("db", 2);
        let token = CancellationToken::new();

        let result = bulkhead
            .execute(&token, || async { Ok::<_, String>("row") })
            .await;

        assert_eq!(result, Ok("row"));
        assert_eq!(bulkhead.current_concurrency(), 0);
    }

    #[tokio::test]
    async fn test_oversized_capacity_is_capped() {
        let bulkhead = Bulkhead::new("db", usize::MAX);
        assert_eq!(bulkhead.max_concurrency(), Semaphore::MAX_PERMITS);

        let token = CancellationToken::new();
        let result = bulkhead
            .execute(&token, || async { Ok::<_, String>("row") })
            .await;
        assert_eq!(result, Ok("row"));
    }

    #[tokio::test]
    async fn test_rejects_when_full_without_waiting() {
        let bulkhead = Arc::new(Bulkhead::new("db", 2));
        let token = CancellationToken::new();
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);

        let mut holders = Vec::new();
        for _ in 0..2 {
            let bulkhead = Arc::clone(&bulkhead);
            let token = token.clone();
            let mut release = release_rx.clone();
            holders.push(tokio::spawn(async move {
                bulkhead
                    .execute(&token, || async move {
                        release.wait_for(|go| *go).await.ok();
                        Ok::<_, String>(())
                    })
                    .await
            }));
        }
        while bulkhead.current_concurrency() < 2 {
            tokio::task::yield_now().await;
        }

        let invoked = std::sync::atomic::AtomicBool::new(false);
        let third = bulkhead
            .execute(&token, || async {
                invoked.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .now_or_never()
            .expect("rejection must not wait");
        assert_eq!(
            third,
            Err(ResilienceError::BulkheadFull {
                name: "db".to_string(),
                max_concurrency: 2
            })
        );
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));

        release_tx.send(true).unwrap();
        for holder in holders {
            assert!(holder.await.unwrap().is_ok());
        }

        let after = bulkhead
            .execute(&token, || async { Ok::<_, String>(()) })
            .await;
        assert!(after.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let bulkhead = Bulkhead::new("db", 1);
        let token = CancellationToken::new();
        token.cancel();

        let result = bulkhead
            .execute(&token, || async { Ok::<_, String>(()) })
            .await;

        assert_eq!(result, Err(ResilienceError::Cancelled));
    }

    #[tokio::test]
    async fn test_slot_released_on_error() {
        let bulkhead = Bulkhead::new("db", 1);
        let token = CancellationToken::new();

        let failed = bulkhead
            .execute(&token, || async { Err::<(), _>("boom") })
            .await;
        assert_eq!(failed, Err(ResilienceError::Inner("boom")));

        let next = bulkhead.execute(&token, || async { Ok::<_, &str>(1) }).await;
        assert_eq!(next, Ok(1));
    }

    #[tokio::test]
    async fn test_slot_released_on_panic() {
        let bulkhead = Arc::new(Bulkhead::new("db", 1));
        let token = CancellationToken::new();

        let panicking = {
            let bulkhead = Arc::clone(&bulkhead);
            let token = token.clone();
            tokio::spawn(async move {
                bulkhead
                    .execute(&token, exploding_handler)
                    .await
            })
        };
        assert!(panicking.await.is_err());

        assert_eq!(bulkhead.current_concurrency(), 0);
        let next = bulkhead.execute(&token, || async { Ok::<_, String>(()) }).await;
        assert!(next.is_ok());
    }

    #[tokio::test]
    async fn test_slot_released_when_future_dropped() {
        let bulkhead = Bulkhead::new("db", 1);
        let token = CancellationToken::new();
        let (_keep, never) = oneshot::channel::<()>();

        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            bulkhead.execute(&token, || async move {
                never.await.ok();
                Ok::<_, String>(())
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(bulkhead.current_concurrency(), 0);
    }

    #[test]
    fn test_registry_from_settings() {
        let settings = BulkheadSettings::default();
        let mut registry = BulkheadRegistry::from_settings(&settings);

        assert_eq!(registry.len(), settings.pools.len());
        assert_eq!(
            registry.get("payments").map(|b| b.max_concurrency()),
            Some(10)
        );
        assert!(registry.get("inventory").is_none());

        let inventory = registry.get_or_register("inventory", settings.default_max_concurrency);
        assert_eq!(inventory.max_concurrency(), 10);
        assert!(registry.names().any(|name| name == "inventory"));
    }
}
