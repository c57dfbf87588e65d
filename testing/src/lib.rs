//! # POS Resilience Testing
//!
//! Testing utilities for the POS resilience layer.
//!
//! This crate provides:
//! - [`ManualClock`]: deterministic wall clock that tests advance by hand
//! - [`FlakyWindowStore`] / [`FlakyCache`]: wrappers that inject store outages on demand,
//!   for fail-open and cache-failure paths
//!
//! ## Example
//!
//! ```
//! use pos_resilience_core::Clock;
//! use pos_resilience_testing::test_clock;
//! use std::time::Duration;
//!
//! let clock = test_clock();
//! let before = clock.now_millis();
//! clock.advance(Duration::from_secs(1));
//! assert_eq!(clock.now_millis() - before, 1_000);
//! ```

use chrono::{DateTime, Utc};
use pos_resilience_core::Clock;

/// Mock implementations of core traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    /// Manually driven clock for deterministic tests
    ///
    /// Time only moves when the test calls [`ManualClock::advance`] or
    /// [`ManualClock::set_millis`]. Clones share the same time, so a test can keep one
    /// handle while the component under test owns another.
    ///
    /// # Example
    ///
    /// ```
    /// use pos_resilience_testing::mocks::ManualClock;
    /// use pos_resilience_core::Clock;
    ///
    /// let clock = ManualClock::at_millis(5_000);
    /// let handle = clock.clone();
    /// handle.set_millis(9_000);
    /// assert_eq!(clock.now_millis(), 9_000); // Shared!
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        millis: Arc<AtomicI64>,
    }

    impl ManualClock {
        /// Start at `millis` since the Unix epoch.
        #[must_use]
        pub fn at_millis(millis: i64) -> Self {
            Self {
                millis: Arc::new(AtomicI64::new(millis)),
            }
        }

        /// Start at `time`.
        #[must_use]
        pub fn at(time: DateTime<Utc>) -> Self {
            Self::at_millis(time.timestamp_millis())
        }

        /// Move time forward by `by`.
        pub fn advance(&self, by: Duration) {
            let step = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
            self.millis.fetch_add(step, Ordering::SeqCst);
        }

        /// Jump to `millis` since the Unix epoch.
        pub fn set_millis(&self, millis: i64) {
            self.millis.store(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            DateTime::from_timestamp_millis(self.now_millis()).unwrap_or_default()
        }

        fn now_millis(&self) -> i64 {
            self.millis.load(Ordering::SeqCst)
        }
    }

    /// Create a clock for tests pinned at 2025-01-01 00:00:00 UTC
    #[must_use]
    pub fn test_clock() -> ManualClock {
        ManualClock::at_millis(1_735_689_600_000)
    }
}

/// Fault-injecting wrappers around shared stores.
pub mod faults {
    use pos_resilience_core::{
        ResultCache, StoreError, WindowAdmission, WindowRequest, WindowStore,
    };
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn outage() -> StoreError {
        StoreError::Unavailable("injected outage".to_string())
    }

    /// [`WindowStore`] that fails every operation while switched to failing.
    #[derive(Debug, Default)]
    pub struct FlakyWindowStore<S> {
        inner: S,
        failing: AtomicBool,
        failures: AtomicUsize,
    }

    impl<S> FlakyWindowStore<S> {
        /// Wrap `inner`, initially healthy.
        #[must_use]
        pub const fn new(inner: S) -> Self {
            Self {
                inner,
                failing: AtomicBool::new(false),
                failures: AtomicUsize::new(0),
            }
        }

        /// Switch the outage on or off.
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        /// Operations rejected so far.
        #[must_use]
        pub fn failures(&self) -> usize {
            self.failures.load(Ordering::SeqCst)
        }

        /// The wrapped store.
        #[must_use]
        pub const fn inner(&self) -> &S {
            &self.inner
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                self.failures.fetch_add(1, Ordering::SeqCst);
                return Err(outage());
            }
            Ok(())
        }
    }

    impl<S: WindowStore> WindowStore for FlakyWindowStore<S> {
        async fn remove_before(&self, key: &str, cutoff_ms: i64) -> Result<(), StoreError> {
            self.check()?;
            self.inner.remove_before(key, cutoff_ms).await
        }

        async fn count(&self, key: &str) -> Result<u64, StoreError> {
            self.check()?;
            self.inner.count(key).await
        }

        async fn record(&self, key: &str, ts_ms: i64, member: &str) -> Result<(), StoreError> {
            self.check()?;
            self.inner.record(key, ts_ms, member).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
            self.check()?;
            self.inner.expire(key, ttl).await
        }

        async fn clear(&self, key: &str) -> Result<(), StoreError> {
            self.check()?;
            self.inner.clear(key).await
        }

        async fn admit(&self, request: &WindowRequest<'_>) -> Result<WindowAdmission, StoreError> {
            self.check()?;
            self.inner.admit(request).await
        }
    }

    /// [`ResultCache`] whose reads and writes can be failed independently.
    #[derive(Debug, Default)]
    pub struct FlakyCache<C> {
        inner: C,
        failing_reads: AtomicBool,
        failing_writes: AtomicBool,
    }

    impl<C> FlakyCache<C> {
        /// Wrap `inner`, initially healthy.
        #[must_use]
        pub const fn new(inner: C) -> Self {
            Self {
                inner,
                failing_reads: AtomicBool::new(false),
                failing_writes: AtomicBool::new(false),
            }
        }

        /// Fail (or stop failing) `get` and `contains`.
        pub fn set_failing_reads(&self, failing: bool) {
            self.failing_reads.store(failing, Ordering::SeqCst);
        }

        /// Fail (or stop failing) `set` and `invalidate`.
        pub fn set_failing_writes(&self, failing: bool) {
            self.failing_writes.store(failing, Ordering::SeqCst);
        }

        /// The wrapped cache.
        #[must_use]
        pub const fn inner(&self) -> &C {
            &self.inner
        }
    }

    impl<V, C> ResultCache<V> for FlakyCache<C>
    where
        V: Send + Sync,
        C: ResultCache<V>,
    {
        async fn get(&self, key: &str) -> Result<Option<V>, StoreError> {
            if self.failing_reads.load(Ordering::SeqCst) {
                return Err(outage());
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &V, ttl: Duration) -> Result<(), StoreError> {
            if self.failing_writes.load(Ordering::SeqCst) {
                return Err(outage());
            }
            self.inner.set(key, value, ttl).await
        }

        async fn invalidate(&self, key: &str) -> Result<(), StoreError> {
            if self.failing_writes.load(Ordering::SeqCst) {
                return Err(outage());
            }
            self.inner.invalidate(key).await
        }
    }
}

// Re-export commonly used items
pub use faults::{FlakyCache, FlakyWindowStore};
pub use mocks::{ManualClock, test_clock};
