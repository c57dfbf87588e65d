//! Injectable wall clock.
//!
//! Sliding-window rate limiting scores requests by wall-clock milliseconds, because the
//! window log is shared across replicas. Everything that reads the time goes through
//! [`Clock`] so tests can pin or advance it.
//!
//! # Example
//!
//! ```
//! use chrono::{DateTime, Utc};
//! use pos_resilience_core::Clock;
//!
//! struct FixedClock { time: DateTime<Utc> }
//! impl Clock for FixedClock {
//!     fn now(&self) -> DateTime<Utc> {
//!         self.time
//!     }
//! }
//!
//! let clock = FixedClock { time: DateTime::from_timestamp_millis(1_000).unwrap_or_default() };
//! assert_eq!(clock.now_millis(), 1_000);
//! ```

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Clock trait for time operations.
pub trait Clock: Send + Sync {
    /// Get the current time
    fn now(&self) -> DateTime<Utc>;

    /// Current time as milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }

    fn now_millis(&self) -> i64 {
        (**self).now_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now_millis();
        let second = clock.now_millis();
        assert!(second >= first);
    }

    #[test]
    fn test_arc_clock_delegates() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        assert!(clock.now_millis() > 0);
    }
}
