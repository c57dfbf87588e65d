//! Distributed sliding-window rate limiter.
//!
//! Admission control keyed by caller identity. Each identifier owns a log of request
//! timestamps in a shared [`WindowStore`], so the limit holds across every replica that
//! talks to the same store.
//!
//! ## Algorithm: sliding-window log
//!
//! ```text
//! window = 60s, limit = 3
//!
//!   t=0   t=10  t=20        t=45   t=61
//!    ●     ●     ●           ✗      ●
//!    └──── 3 entries ────┘   deny   t=0 slid out → allow
//! ```
//!
//! 1. Drop entries older than `now - window`
//! 2. Count what is left; at or above `limit` → deny, retry after `window`
//! 3. Otherwise record `now` and refresh the key's expiry to `window`
//!
//! ## Failure policy
//!
//! If the store is unreachable the limiter fails **open**: the request is allowed and
//! the outage is logged. Admission control must not become the outage.
//!
//! # Example
//!
//! ```rust
//! use pos_resilience_runtime::memory_store::MemoryWindowStore;
//! use pos_resilience_runtime::rate_limiter::{RateLimiter, RateLimiterConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let limiter = RateLimiter::new(
//!     "gateway",
//!     MemoryWindowStore::new(),
//!     RateLimiterConfig::new(100, Duration::from_secs(60)),
//! );
//!
//! let decision = limiter.check("203.0.113.7").await;
//! assert!(decision.is_allowed());
//! # }
//! ```

use crate::metrics::RateLimiterMetrics;
use pos_resilience_core::config::RateLimitSettings;
use pos_resilience_core::{
    Clock, ResilienceError, StoreError, SystemClock, WindowRequest, WindowStore,
};
use std::time::Duration;
use uuid::Uuid;

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Maximum requests per identifier inside one window
    pub limit: u64,
    /// Trailing window length
    pub window: Duration,
    /// Prefix for store keys (`{prefix}:{identifier}`)
    pub key_prefix: String,
}

impl RateLimiterConfig {
    /// `limit` requests per `window`, default key prefix.
    #[must_use]
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            key_prefix: "ratelimit".to_string(),
        }
    }

    /// Override the key prefix.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::new(100, Duration::from_secs(60))
    }
}

impl From<&RateLimitSettings> for RateLimiterConfig {
    fn from(settings: &RateLimitSettings) -> Self {
        Self::new(settings.limit, settings.window()).with_key_prefix(&settings.key_prefix)
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Under the limit; the request was recorded.
    Allowed {
        /// Requests left in the current window
        remaining: u64,
    },
    /// The store was unavailable; allowed without being counted.
    Bypassed,
    /// Over the limit.
    Denied {
        /// How long to wait before retrying
        retry_after: Duration,
    },
}

impl RateLimitDecision {
    /// Whether the request may proceed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        !matches!(self, Self::Denied { .. })
    }
}

/// Identity a request is limited under: the authenticated user when known, otherwise
/// the remote address.
#[must_use]
pub fn client_identifier<'a>(remote_ip: &'a str, user_id: Option<&'a str>) -> &'a str {
    match user_id {
        Some(user) if !user.is_empty() => user,
        _ => remote_ip,
    }
}

/// Sliding-window rate limiter over a shared [`WindowStore`].
#[derive(Debug)]
pub struct RateLimiter<S, C = SystemClock> {
    name: String,
    store: S,
    clock: C,
    config: RateLimiterConfig,
}

impl<S: WindowStore> RateLimiter<S> {
    /// Create a limiter that reads the system clock.
    #[must_use]
    pub fn new(name: impl Into<String>, store: S, config: RateLimiterConfig) -> Self {
        Self {
            name: name.into(),
            store,
            clock: SystemClock,
            config,
        }
    }
}

impl<S: WindowStore, C: Clock> RateLimiter<S, C> {
    /// Swap the clock (tests pin or advance time through this).
    #[must_use]
    pub fn with_clock<C2: Clock>(self, clock: C2) -> RateLimiter<S, C2> {
        RateLimiter {
            name: self.name,
            store: self.store,
            clock,
            config: self.config,
        }
    }

    /// Decide whether `identifier` may make a request now, recording it if so.
    pub async fn check(&self, identifier: &str) -> RateLimitDecision {
        let key = self.key(identifier);
        let now_ms = self.clock.now_millis();
        let member = format!("{now_ms}-{}", Uuid::new_v4());
        let request = WindowRequest {
            key: &key,
            now_ms,
            window: self.config.window,
            limit: self.config.limit,
            member: &member,
        };

        match self.store.admit(&request).await {
            Ok(admission) if admission.admitted => {
                RateLimiterMetrics::record_allowed(&self.name);
                RateLimitDecision::Allowed {
                    remaining: self
                        .config
                        .limit
                        .saturating_sub(admission.count.saturating_add(1)),
                }
            }
            Ok(admission) => {
                RateLimiterMetrics::record_denied(&self.name);
                tracing::warn!(
                    limiter = %self.name,
                    key = %key,
                    count = admission.count,
                    limit = self.config.limit,
                    "Rate limit exceeded"
                );
                RateLimitDecision::Denied {
                    retry_after: self.config.window,
                }
            }
            Err(e) => {
                RateLimiterMetrics::record_fail_open(&self.name);
                tracing::warn!(
                    limiter = %self.name,
                    key = %key,
                    error = %e,
                    "Rate limit store unavailable, allowing request (fail open)"
                );
                RateLimitDecision::Bypassed
            }
        }
    }

    /// [`RateLimiter::check`] expressed as a guard step.
    ///
    /// # Errors
    ///
    /// Returns `ResilienceError::RateLimited` when the identifier is over its limit.
    pub async fn acquire<E>(&self, identifier: &str) -> Result<(), ResilienceError<E>> {
        match self.check(identifier).await {
            RateLimitDecision::Denied { retry_after } => {
                Err(ResilienceError::RateLimited { retry_after })
            }
            RateLimitDecision::Allowed { .. } | RateLimitDecision::Bypassed => Ok(()),
        }
    }

    /// Forget every recorded request for `identifier`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be reached.
    pub async fn reset(&self, identifier: &str) -> Result<(), StoreError> {
        let key = self.key(identifier);
        self.store.clear(&key).await?;
        tracing::info!(limiter = %self.name, key = %key, "Reset rate limit");
        Ok(())
    }

    /// Store key for `identifier`.
    #[must_use]
    pub fn key(&self, identifier: &str) -> String {
        format!("{}:{identifier}", self.config.key_prefix)
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// The backing store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Limiter name used in logs and metrics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}
