//! Composed protection for one downstream dependency.
//!
//! A [`DependencyGuard`] stacks the admission checks in the order a request meets them:
//!
//! ```text
//! request ──► RateLimiter ──► Bulkhead ──► CircuitBreaker ──► operation
//!              (quota)        (capacity)     (health)
//! ```
//!
//! Each stage fails fast with its own [`ResilienceError`] variant; nothing is retried.
//! The rate limiter is optional (internal dependencies are usually not keyed by caller).

use crate::bulkhead::Bulkhead;
use crate::circuit_breaker::CircuitBreaker;
use crate::memory_store::MemoryWindowStore;
use crate::rate_limiter::RateLimiter;
use crate::worker_pool::WorkerPool;
use pos_resilience_core::{CancellationToken, Clock, ResilienceError, SystemClock, WindowStore};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Rate limiter, bulkhead and circuit breaker for one dependency.
#[derive(Debug)]
pub struct DependencyGuard<S = MemoryWindowStore, C = SystemClock> {
    limiter: Option<Arc<RateLimiter<S, C>>>,
    bulkhead: Arc<Bulkhead>,
    breaker: Arc<CircuitBreaker>,
}

impl DependencyGuard {
    /// Guard with a bulkhead and a circuit breaker and no rate limit.
    #[must_use]
    pub const fn new(bulkhead: Arc<Bulkhead>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            limiter: None,
            bulkhead,
            breaker,
        }
    }
}

impl<S, C> DependencyGuard<S, C>
where
    S: WindowStore,
    C: Clock,
{
    /// Put `limiter` in front of the bulkhead.
    #[must_use]
    pub fn with_rate_limiter<S2, C2>(self, limiter: Arc<RateLimiter<S2, C2>>) -> DependencyGuard<S2, C2>
    where
        S2: WindowStore,
        C2: Clock,
    {
        DependencyGuard {
            limiter: Some(limiter),
            bulkhead: self.bulkhead,
            breaker: self.breaker,
        }
    }

    /// Run `operation` in the caller's task behind every configured check.
    ///
    /// `identifier` keys the rate limit and is ignored when no limiter is configured.
    ///
    /// # Errors
    ///
    /// Returns the first rejection (`RateLimited`, `Cancelled`, `BulkheadFull`,
    /// `CircuitOpen`) or `Inner` with the operation's own error.
    pub async fn call<F, Fut, T, E>(
        &self,
        identifier: &str,
        token: &CancellationToken,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(limiter) = &self.limiter {
            limiter.acquire::<E>(identifier).await?;
        }

        self.bulkhead
            .execute(token, || self.breaker.call(operation))
            .await
            .map_err(ResilienceError::flatten)
    }

    /// Like [`DependencyGuard::call`], but the whole guarded call runs as a task on
    /// `pool`. Waits for queue space, then for the result.
    ///
    /// # Errors
    ///
    /// Everything [`DependencyGuard::call`] returns, plus `Cancelled` if `token` fires
    /// before the result arrives and `PoolUnavailable` if the pool is stopped or drops
    /// the task.
    pub async fn call_on<F, Fut, T, E>(
        self: &Arc<Self>,
        pool: &WorkerPool,
        identifier: &str,
        token: &CancellationToken,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        S: 'static,
        C: 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let guard = Arc::clone(self);
        let identifier = identifier.to_string();
        let task_token = token.clone();

        pool.submit_with(
            async move {
                let result = guard.call(&identifier, &task_token, operation).await;
                // The caller may have stopped waiting
                let _ = result_tx.send(result);
            },
            token,
        )
        .await
        .map_err(|e| e.into_resilience())?;

        tokio::select! {
            biased;
            () = token.cancelled() => Err(ResilienceError::Cancelled),
            result = result_rx => result.unwrap_or(Err(ResilienceError::PoolUnavailable)),
        }
    }

    /// The bulkhead stage.
    #[must_use]
    pub fn bulkhead(&self) -> &Bulkhead {
        &self.bulkhead
    }

    /// The circuit breaker stage.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The rate limiter stage, if configured.
    #[must_use]
    pub fn rate_limiter(&self) -> Option<&RateLimiter<S, C>> {
        self.limiter.as_deref()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::rate_limiter::RateLimiterConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn guard(capacity: usize, max_failures: u32) -> DependencyGuard {
        DependencyGuard::new(
            Arc::new(Bulkhead::new("payments", capacity)),
            Arc::new(CircuitBreaker::new(
                "payments",
                CircuitBreakerConfig::builder()
                    .max_failures(max_failures)
                    .reset_timeout(Duration::from_secs(30))
                    .build(),
            )),
        )
    }

    #[tokio::test]
    async fn test_passes_through_success_and_inner_error() {
        let guard = guard(2, 3);
        let token = CancellationToken::new();

        let ok = guard
            .call("till-1", &token, || async { Ok::<_, String>(42) })
            .await;
        assert_eq!(ok, Ok(42));

        let err = guard
            .call("till-1", &token, || async { Err::<u8, _>("declined".to_string()) })
            .await;
        assert_eq!(err, Err(ResilienceError::Inner("declined".to_string())));
        assert_eq!(guard.breaker().failure_count(), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_is_flattened() {
        let guard = guard(2, 1);
        let token = CancellationToken::new();

        let _ = guard
            .call("till-1", &token, || async { Err::<(), _>("timeout") })
            .await;
        assert_eq!(guard.breaker().state(), CircuitState::Open);

        let invoked = AtomicUsize::new(0);
        let rejected = guard
            .call("till-1", &token, || async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &str>(())
            })
            .await;
        assert_eq!(
            rejected,
            Err(ResilienceError::CircuitOpen {
                name: "payments".to_string()
            })
        );
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(guard.bulkhead().current_concurrency(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_before_bulkhead() {
        let limiter = Arc::new(RateLimiter::new(
            "gateway",
            MemoryWindowStore::new(),
            RateLimiterConfig::new(1, Duration::from_secs(60)),
        ));
        let guard = guard(1, 3).with_rate_limiter(limiter);
        let token = CancellationToken::new();

        assert!(guard
            .call("user-7", &token, || async { Ok::<_, ()>(()) })
            .await
            .is_ok());
        let limited = guard
            .call("user-7", &token, || async { Ok::<_, ()>(()) })
            .await;
        assert_eq!(limited.unwrap_err().retry_after(), Some(Duration::from_secs(60)));
        // Another caller has its own quota
        assert!(guard
            .call("user-8", &token, || async { Ok::<_, ()>(()) })
            .await
            .is_ok());
        assert!(guard.rate_limiter().is_some());
    }

    #[tokio::test]
    async fn test_cancelled_token_rejected_by_bulkhead() {
        let guard = guard(1, 3);
        let token = CancellationToken::new();
        token.cancel();

        let result = guard.call("x", &token, || async { Ok::<_, ()>(()) }).await;
        assert_eq!(result, Err(ResilienceError::Cancelled));
    }

    #[tokio::test]
    async fn test_call_on_runs_on_pool() {
        let pool = WorkerPool::new("guarded", 2, 4);
        pool.start().unwrap();
        let guard = Arc::new(guard(2, 3));
        let token = CancellationToken::new();

        let value = guard
            .call_on(&pool, "till-1", &token, || async { Ok::<_, String>("charged") })
            .await;
        assert_eq!(value, Ok("charged"));

        pool.stop().await;
        let after_stop = guard
            .call_on(&pool, "till-1", &token, || async { Ok::<_, String>("late") })
            .await;
        assert_eq!(after_stop, Err(ResilienceError::PoolUnavailable));
    }
}
