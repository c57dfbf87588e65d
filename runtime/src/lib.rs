//! # POS Resilience Runtime
//!
//! Runtime primitives that keep one slow or failing dependency from taking down a POS
//! service.
//!
//! ## Core Components
//!
//! - **Circuit breaker**: stops calling a dependency that keeps failing, probes it again
//!   after a cooldown
//! - **Bulkhead**: hard cap on concurrent use of one resource pool, fail-fast
//! - **Worker pool**: fixed workers over one bounded queue with backpressure
//! - **Rate limiter**: sliding-window log per caller in a shared store, fails open
//! - **Request coalescer**: single-flight loads in front of a result cache
//!
//! Supporting pieces: in-memory stores, object pools, cache warming, a composed
//! [`guard::DependencyGuard`], Prometheus metrics, tracing bootstrap, and shutdown
//! coordination.
//!
//! ## Example
//!
//! ```rust
//! use pos_resilience_runtime::bulkhead::Bulkhead;
//! use pos_resilience_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use pos_resilience_runtime::guard::DependencyGuard;
//! use pos_resilience_core::CancellationToken;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let guard = DependencyGuard::new(
//!     Arc::new(Bulkhead::new("payments", 10)),
//!     Arc::new(CircuitBreaker::new("payments", CircuitBreakerConfig::default())),
//! );
//!
//! let charged = guard
//!     .call("till-4", &CancellationToken::new(), || async {
//!         Ok::<_, String>("auth-code-1234")
//!     })
//!     .await;
//! assert!(charged.is_ok());
//! # }
//! ```

/// Fail-fast concurrency limits per resource pool
pub mod bulkhead;

/// Circuit breaker pattern for preventing cascading failures
pub mod circuit_breaker;

/// Single-flight loading in front of a result cache
pub mod coalescer;

pub mod fan;

/// Rate limiter, bulkhead and circuit breaker composed per dependency
pub mod guard;

pub mod memory_cache;

pub mod memory_store;

/// Prometheus metrics for observability
pub mod metrics;

pub mod object_pool;

/// Distributed sliding-window rate limiting
pub mod rate_limiter;

pub mod shutdown;

pub mod telemetry;

pub mod warming;

/// Bounded worker pool with backpressure
pub mod worker_pool;

pub use bulkhead::{Bulkhead, BulkheadRegistry};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use coalescer::RequestCoalescer;
pub use guard::DependencyGuard;
pub use rate_limiter::{RateLimitDecision, RateLimiter, RateLimiterConfig};
pub use worker_pool::WorkerPool;
