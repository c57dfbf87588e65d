//! Circuit breaker pattern for preventing cascading failures.
//!
//! A circuit breaker monitors calls to one dependency and "opens" (stops allowing calls)
//! when consecutive failures reach a threshold, so callers fail fast instead of piling up
//! on a dependency that is down.
//!
//! # States
//!
//! - **Closed**: Normal operation. Calls pass through. Consecutive failures are counted.
//! - **Open**: Too many failures. Calls fail immediately until the reset timeout elapses.
//! - **`HalfOpen`**: After the timeout, exactly one trial call is let through. Success
//!   closes the circuit, failure reopens it. Other callers fail fast while the trial runs.
//!
//! The state lock is never held while the wrapped operation runs.
//!
//! # Example
//!
//! ```rust
//! use pos_resilience_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CircuitBreakerConfig::builder()
//!     .max_failures(5)
//!     .reset_timeout(Duration::from_secs(30))
//!     .build();
//!
//! let breaker = CircuitBreaker::new("payments", config);
//!
//! match breaker.call(|| async {
//!     // Your fallible operation
//!     Ok::<_, String>(42)
//! }).await {
//!     Ok(result) => println!("Success: {result}"),
//!     Err(e) => println!("Failed: {e}"),
//! }
//! # Ok(())
//! # }
//! ```

use crate::metrics::CircuitBreakerMetrics;
use parking_lot::Mutex;
use pos_resilience_core::config::CircuitBreakerSettings;
use pos_resilience_core::ResilienceError;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub max_failures: u32,
    /// Duration to wait in Open before allowing a trial call
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            max_failures: None,
            reset_timeout: None,
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            max_failures: settings.max_failures,
            reset_timeout: settings.reset_timeout(),
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    max_failures: Option<u32>,
    reset_timeout: Option<Duration>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the failure threshold.
    ///
    /// Circuit opens after this many consecutive failures. Zero is treated as one.
    #[must_use]
    pub const fn max_failures(mut self, threshold: u32) -> Self {
        self.max_failures = Some(threshold);
        self
    }

    /// Set the reset timeout.
    ///
    /// How long to wait in Open state before letting a trial call through.
    #[must_use]
    pub const fn reset_timeout(mut self, duration: Duration) -> Self {
        self.reset_timeout = Some(duration);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        let defaults = CircuitBreakerConfig::default();
        CircuitBreakerConfig {
            max_failures: self.max_failures.unwrap_or(defaults.max_failures).max(1),
            reset_timeout: self.reset_timeout.unwrap_or(defaults.reset_timeout),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Circuit is closed, calls pass through normally
    Closed,
    /// Circuit is open, calls fail immediately
    Open,
    /// Circuit is half-open, one trial call tests whether the dependency recovered
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: 0 = Closed, 1 = `HalfOpen`, 2 = Open.
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }

    /// Lowercase label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listener notified whenever the breaker actually changes state.
///
/// Called outside the breaker's lock. A panicking observer is caught and logged; it
/// never reaches the caller.
pub trait StateObserver: Send + Sync {
    /// `breaker` moved from `from` to `to`.
    fn on_state_change(&self, breaker: &str, from: CircuitState, to: CircuitState);
}

impl<F> StateObserver for F
where
    F: Fn(&str, CircuitState, CircuitState) + Send + Sync,
{
    fn on_state_change(&self, breaker: &str, from: CircuitState, to: CircuitState) {
        self(breaker, from, to);
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerState {
    /// Move to `to`, returning the transition if the state actually changed.
    fn transition(&mut self, to: CircuitState) -> Option<(CircuitState, CircuitState)> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        if to == CircuitState::Closed {
            self.failure_count = 0;
        }
        if to != CircuitState::HalfOpen {
            self.trial_in_flight = false;
        }
        Some((from, to))
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
#[derive(Debug, Clone, Copy)]
struct Admission {
    trial: bool,
}

/// Circuit breaker for preventing cascading failures.
///
/// One instance per protected dependency, shared behind an `Arc`.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    observer: Option<Arc<dyn StateObserver>>,
    // Counters
    total_calls: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        CircuitBreakerMetrics::record_state(&name, CircuitState::Closed);
        Self {
            name,
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
            observer: None,
            total_calls: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// Register a state-change observer.
    #[must_use]
    pub fn with_observer(mut self, observer: impl StateObserver + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Name of the protected dependency.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration this breaker was built with.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state of the circuit breaker.
    ///
    /// Open → `HalfOpen` is evaluated lazily on the next call, so this reports Open until
    /// a call arrives after the reset timeout.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Current consecutive failure count.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Call an operation through the circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns `ResilienceError::CircuitOpen` without invoking `operation` if the circuit
    /// is open (or a half-open trial is already running).
    /// Returns `ResilienceError::Inner` if the operation fails.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        CircuitBreakerMetrics::record_call(&self.name);

        let Some(admission) = self.try_acquire() else {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            CircuitBreakerMetrics::record_rejection(&self.name);
            tracing::debug!(breaker = %self.name, "Circuit breaker is OPEN, rejecting call");
            return Err(ResilienceError::CircuitOpen {
                name: self.name.clone(),
            });
        };

        // Releases the half-open slot if this future is dropped mid-trial
        let mut trial = admission.trial.then(|| TrialSlot {
            breaker: self,
            armed: true,
        });

        let outcome = operation().await;
        if let Some(slot) = trial.as_mut() {
            slot.armed = false;
        }

        match outcome {
            Ok(result) => {
                self.total_successes.fetch_add(1, Ordering::Relaxed);
                CircuitBreakerMetrics::record_success(&self.name);
                self.on_success(admission);
                Ok(result)
            }
            Err(err) => {
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                CircuitBreakerMetrics::record_failure(&self.name);
                self.on_failure(admission);
                Err(ResilienceError::Inner(err))
            }
        }
    }

    /// Decide whether a call may proceed.
    fn try_acquire(&self) -> Option<Admission> {
        let (admission, change) = {
            let mut state = self.state.lock();
            match state.state {
                CircuitState::Closed => (Some(Admission { trial: false }), None),
                CircuitState::HalfOpen => {
                    if state.trial_in_flight {
                        (None, None)
                    } else {
                        state.trial_in_flight = true;
                        (Some(Admission { trial: true }), None)
                    }
                }
                CircuitState::Open => {
                    let cooled_down = state
                        .last_failure
                        .is_none_or(|at| at.elapsed() >= self.config.reset_timeout);
                    if cooled_down {
                        let change = state.transition(CircuitState::HalfOpen);
                        state.trial_in_flight = true;
                        (Some(Admission { trial: true }), change)
                    } else {
                        (None, None)
                    }
                }
            }
        };
        self.notify(change);
        admission
    }

    /// Handle successful operation.
    fn on_success(&self, admission: Admission) {
        let change = {
            let mut state = self.state.lock();
            match state.state {
                CircuitState::HalfOpen if admission.trial => {
                    state.transition(CircuitState::Closed)
                }
                // A straggler admitted before the circuit opened; only the trial decides
                CircuitState::HalfOpen => None,
                CircuitState::Closed | CircuitState::Open => {
                    state.failure_count = 0;
                    None
                }
            }
        };
        self.notify(change);
    }

    /// Handle failed operation.
    fn on_failure(&self, admission: Admission) {
        let change = {
            let mut state = self.state.lock();
            match state.state {
                CircuitState::HalfOpen if !admission.trial => None,
                CircuitState::HalfOpen => {
                    state.failure_count = state.failure_count.saturating_add(1);
                    state.last_failure = Some(Instant::now());
                    state.transition(CircuitState::Open)
                }
                CircuitState::Closed | CircuitState::Open => {
                    state.failure_count = state.failure_count.saturating_add(1);
                    state.last_failure = Some(Instant::now());
                    if state.failure_count >= self.config.max_failures {
                        state.transition(CircuitState::Open)
                    } else {
                        None
                    }
                }
            }
        };
        self.notify(change);
    }

    fn release_trial(&self) {
        let mut state = self.state.lock();
        if state.state == CircuitState::HalfOpen {
            state.trial_in_flight = false;
        }
    }

    /// Report a transition: log, metrics, observer. Never called with the lock held.
    fn notify(&self, change: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = change else {
            return;
        };

        match to {
            CircuitState::Open => tracing::warn!(
                breaker = %self.name,
                from = %from,
                to = %to,
                max_failures = self.config.max_failures,
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen | CircuitState::Closed => tracing::info!(
                breaker = %self.name,
                from = %from,
                to = %to,
                "Circuit breaker state changed"
            ),
        }
        CircuitBreakerMetrics::record_transition(&self.name, from, to);

        if let Some(observer) = &self.observer {
            let notified =
                catch_unwind(AssertUnwindSafe(|| observer.on_state_change(&self.name, from, to)));
            if notified.is_err() {
                tracing::error!(breaker = %self.name, "Circuit breaker state observer panicked");
            }
        }
    }

    /// Get cumulative call statistics.
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Reset the circuit breaker to closed state.
    ///
    /// Useful for testing or manual intervention.
    pub fn reset(&self) {
        let change = {
            let mut state = self.state.lock();
            state.failure_count = 0;
            state.last_failure = None;
            state.transition(CircuitState::Closed)
        };
        tracing::info!(breaker = %self.name, "Circuit breaker manually reset to CLOSED");
        self.notify(change);
    }
}

/// Held for the duration of a half-open trial; dropping it early frees the slot.
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::debug!(breaker = %self.breaker.name, "Half-open trial abandoned");
        self.breaker.release_trial();
    }
}

/// Cumulative statistics for circuit breaker monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    /// Total number of calls attempted
    pub total_calls: u64,
    /// Total number of successful calls
    pub total_successes: u64,
    /// Total number of failed calls
    pub total_failures: u64,
    /// Total number of rejected calls (circuit open)
    pub total_rejections: u64,
}

impl CircuitBreakerStats {
    /// Calculate success rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 1.0;
        }
        self.total_successes as f64 / self.total_calls as f64
    }

    /// Calculate rejection rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.total_rejections as f64 / self.total_calls as f64
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn panicking_observer(_: &str, _: CircuitState, _: CircuitState) {
        panic!("observer bug");
    }

    fn breaker(max_failures: u32, reset_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::builder()
                .max_failures(max_failures)
                .reset_timeout(reset_timeout)
                .build(),
        )
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker.call(|| async { Err::<(), _>("error") }).await;
    }

    #[tokio::test]
    async fn test_closed_on_success() {
        let breaker = breaker(3, Duration::from_secs(1));

        let result = breaker.call(|| async { Ok::<_, String>(42) }).await;

        assert_eq!(result, Ok(42));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_max_failures() {
        let breaker = breaker(3, Duration::from_secs(1));

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 2);

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = breaker(3, Duration::from_secs(1));

        fail(&breaker).await;
        fail(&breaker).await;
        let _ = breaker.call(|| async { Ok::<_, String>(()) }).await;
        assert_eq!(breaker.failure_count(), 0);

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_rejects_without_invoking_when_open() {
        let breaker = breaker(2, Duration::from_secs(60));
        fail(&breaker).await;
        fail(&breaker).await;

        let invoked = AtomicUsize::new(0);
        let result = breaker
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(42)
            })
            .await;

        assert_eq!(
            result,
            Err(ResilienceError::CircuitOpen {
                name: "test".to_string()
            })
        );
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_success_closes() {
        let breaker = breaker(2, Duration::from_millis(100));
        fail(&breaker).await;
        fail(&breaker).await;

        tokio::time::advance(Duration::from_millis(150)).await;

        let result = breaker.call(|| async { Ok::<_, String>(7) }).await;
        assert_eq!(result, Ok(7));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_failure_reopens() {
        let breaker = breaker(2, Duration::from_millis(100));
        fail(&breaker).await;
        fail(&breaker).await;

        tokio::time::advance(Duration::from_millis(150)).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // Cooldown restarts from the trial failure
        let result = breaker.call(|| async { Ok::<_, String>(()) }).await;
        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let breaker = Arc::new(breaker(1, Duration::from_millis(100)));
        fail(&breaker).await;
        tokio::time::advance(Duration::from_millis(150)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                breaker
                    .call(|| async move {
                        release_rx.await.ok();
                        Ok::<_, String>(())
                    })
                    .await
            })
        };
        while breaker.state() != CircuitState::HalfOpen {
            tokio::task::yield_now().await;
        }

        let concurrent = breaker.call(|| async { Ok::<_, String>(()) }).await;
        assert!(matches!(concurrent, Err(ResilienceError::CircuitOpen { .. })));

        release_tx.send(()).unwrap();
        assert!(trial.await.unwrap().is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_releases_slot() {
        let breaker = breaker(1, Duration::from_millis(100));
        fail(&breaker).await;
        tokio::time::advance(Duration::from_millis(150)).await;

        // Trial that never completes, cancelled by the timeout
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            breaker.call(|| std::future::pending::<Result<(), String>>()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let retry = breaker.call(|| async { Ok::<_, String>(()) }).await;
        assert!(retry.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_each_transition_once() {
        let seen = Arc::new(parking_lot::Mutex::new(
            Vec::<(CircuitState, CircuitState)>::new(),
        ));
        let recorder = Arc::clone(&seen);
        let breaker = CircuitBreaker::new(
            "observed",
            CircuitBreakerConfig::builder()
                .max_failures(2)
                .reset_timeout(Duration::from_millis(100))
                .build(),
        )
        .with_observer(move |name: &str, from: CircuitState, to: CircuitState| {
            assert_eq!(name, "observed");
            recorder.lock().push((from, to));
        });

        fail(&breaker).await;
        // Below threshold: no transition, no notification
        assert!(seen.lock().is_empty());
        fail(&breaker).await;
        fail(&breaker).await; // rejected while open
        tokio::time::advance(Duration::from_millis(150)).await;
        let _ = breaker.call(|| async { Ok::<_, String>(()) }).await;

        assert_eq!(
            *seen.lock(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn test_panicking_observer_is_contained() {
        let breaker = CircuitBreaker::new(
            "observed",
            CircuitBreakerConfig::builder().max_failures(1).build(),
        )
        .with_observer(panicking_observer);

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_stats() {
        let breaker = breaker(10, Duration::from_secs(1));

        for _ in 0..3 {
            let _ = breaker.call(|| async { Ok::<_, String>(42) }).await;
        }
        for _ in 0..2 {
            fail(&breaker).await;
        }

        let stats = breaker.stats();
        assert_eq!(stats.total_calls, 5);
        assert_eq!(stats.total_successes, 3);
        assert_eq!(stats.total_failures, 2);
        assert!((stats.success_rate() - 0.6).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_reset() {
        let breaker = breaker(2, Duration::from_secs(60));
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert!(breaker.call(|| async { Ok::<_, String>(()) }).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_calls() {
        let breaker = Arc::new(breaker(5, Duration::from_secs(1)));
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..100 {
            let breaker = Arc::clone(&breaker);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                let _ = breaker
                    .call(|| async {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(())
                    })
                    .await;
            }));
        }

        for handle in handles {
            handle.await.ok();
        }

        let stats = breaker.stats();
        assert_eq!(stats.total_calls, 100);
        assert_eq!(stats.total_successes, 100);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }
}
