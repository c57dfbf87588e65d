//! Error types for the resilience layer.
//!
//! The layer never retries on its own. It classifies a failure and hands it back:
//! rejections (`CircuitOpen`, `BulkheadFull`, `RateLimited`) mean the protected call was
//! never made, `Cancelled` means the caller stopped waiting, and `Inner` carries the
//! wrapped operation's own error unchanged.

use std::time::Duration;
use thiserror::Error;

/// Errors returned by guarded calls.
///
/// Generic over the wrapped operation's error type `E`, which is passed through
/// untouched in [`ResilienceError::Inner`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResilienceError<E> {
    /// The circuit breaker protecting the dependency is open; the call was skipped.
    #[error("circuit breaker `{name}` is open")]
    CircuitOpen {
        /// Name of the breaker that rejected the call
        name: String,
    },

    /// The bulkhead for the resource pool is saturated; the call was skipped.
    #[error("bulkhead `{name}` is full ({max_concurrency} calls in flight)")]
    BulkheadFull {
        /// Name of the bulkhead that rejected the call
        name: String,
        /// Capacity of the bulkhead
        max_concurrency: usize,
    },

    /// The caller is over quota for the current window.
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited {
        /// How long the caller should wait before retrying
        retry_after: Duration,
    },

    /// The caller (or the system) cancelled the wait.
    #[error("operation cancelled")]
    Cancelled,

    /// The worker pool that was asked to run the call is stopped.
    #[error("worker pool is not accepting work")]
    PoolUnavailable,

    /// The wrapped operation failed.
    #[error("operation failed: {0}")]
    Inner(E),
}

impl<E> ResilienceError<E> {
    /// Whether the call was rejected before the wrapped operation ran.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::BulkheadFull { .. } | Self::RateLimited { .. }
        )
    }

    /// The wrapped operation's error, if that is what this is.
    #[must_use]
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(err) => Some(err),
            _ => None,
        }
    }

    /// Retry hint carried by a rate-limit rejection.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Map the wrapped operation's error, keeping every other variant as is.
    pub fn map_inner<F, G>(self, f: G) -> ResilienceError<F>
    where
        G: FnOnce(E) -> F,
    {
        match self {
            Self::CircuitOpen { name } => ResilienceError::CircuitOpen { name },
            Self::BulkheadFull {
                name,
                max_concurrency,
            } => ResilienceError::BulkheadFull {
                name,
                max_concurrency,
            },
            Self::RateLimited { retry_after } => ResilienceError::RateLimited { retry_after },
            Self::Cancelled => ResilienceError::Cancelled,
            Self::PoolUnavailable => ResilienceError::PoolUnavailable,
            Self::Inner(err) => ResilienceError::Inner(f(err)),
        }
    }
}

impl<E> ResilienceError<ResilienceError<E>> {
    /// Collapse one level of nesting produced by stacking guards.
    ///
    /// A bulkhead wrapping a circuit breaker yields
    /// `ResilienceError<ResilienceError<E>>`; this returns the innermost classification.
    #[must_use]
    pub fn flatten(self) -> ResilienceError<E> {
        match self {
            Self::Inner(inner) => inner,
            Self::CircuitOpen { name } => ResilienceError::CircuitOpen { name },
            Self::BulkheadFull {
                name,
                max_concurrency,
            } => ResilienceError::BulkheadFull {
                name,
                max_concurrency,
            },
            Self::RateLimited { retry_after } => ResilienceError::RateLimited { retry_after },
            Self::Cancelled => ResilienceError::Cancelled,
            Self::PoolUnavailable => ResilienceError::PoolUnavailable,
        }
    }
}

/// Errors from the bounded worker pool.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The pool's cancellation signal (or the caller's token) fired while waiting.
    #[error("worker pool submission cancelled")]
    Cancelled,

    /// The pool has been stopped and accepts no further work.
    #[error("worker pool is stopped")]
    Stopped,

    /// Non-blocking submission found the queue full.
    #[error("worker pool queue is full")]
    QueueFull,

    /// `start` was called on a pool that is already running.
    #[error("worker pool is already started")]
    AlreadyStarted,
}

impl PoolError {
    /// Classify a pool failure as a guarded-call error.
    #[must_use]
    pub const fn into_resilience<E>(self) -> ResilienceError<E> {
        match self {
            Self::Cancelled => ResilienceError::Cancelled,
            Self::Stopped | Self::QueueFull | Self::AlreadyStarted => {
                ResilienceError::PoolUnavailable
            }
        }
    }
}

/// Errors from shared stores (rate-limit windows, result caches).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or refused the command.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A cached value could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The store answered with something we did not expect.
    #[error("unexpected store response: {0}")]
    Protocol(String),
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Required environment variable not set
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    /// Invalid environment name
    #[error("Invalid environment: {0}")]
    InvalidEnvironment(String),

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Failed to read a configuration file
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_are_classified() {
        let open: ResilienceError<String> = ResilienceError::CircuitOpen {
            name: "payments".to_string(),
        };
        assert!(open.is_rejection());
        assert_eq!(open.to_string(), "circuit breaker `payments` is open");

        let inner: ResilienceError<String> = ResilienceError::Inner("boom".to_string());
        assert!(!inner.is_rejection());
        assert_eq!(inner.into_inner(), Some("boom".to_string()));
    }

    #[test]
    fn test_retry_after_only_on_rate_limit() {
        let limited: ResilienceError<()> = ResilienceError::RateLimited {
            retry_after: Duration::from_secs(60),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(60)));
        assert_eq!(ResilienceError::<()>::Cancelled.retry_after(), None);
    }

    #[test]
    fn test_flatten_nested_errors() {
        let nested: ResilienceError<ResilienceError<&str>> =
            ResilienceError::Inner(ResilienceError::CircuitOpen {
                name: "db".to_string(),
            });
        assert_eq!(
            nested.flatten(),
            ResilienceError::CircuitOpen {
                name: "db".to_string()
            }
        );

        let outer: ResilienceError<ResilienceError<&str>> = ResilienceError::BulkheadFull {
            name: "db".to_string(),
            max_concurrency: 2,
        };
        assert_eq!(
            outer.flatten(),
            ResilienceError::BulkheadFull {
                name: "db".to_string(),
                max_concurrency: 2
            }
        );

        let leaf: ResilienceError<ResilienceError<&str>> =
            ResilienceError::Inner(ResilienceError::Inner("io"));
        assert_eq!(leaf.flatten(), ResilienceError::Inner("io"));
    }

    #[test]
    fn test_pool_error_classification() {
        assert_eq!(
            PoolError::Cancelled.into_resilience::<()>(),
            ResilienceError::Cancelled
        );
        assert_eq!(
            PoolError::Stopped.into_resilience::<()>(),
            ResilienceError::PoolUnavailable
        );
    }
}
