//! # POS Resilience Core
//!
//! Core traits and types for the resilience and concurrency-control layer of the
//! point-of-sale platform.
//!
//! This crate holds the pieces every other crate in the workspace agrees on:
//!
//! - **Errors**: the failure taxonomy (`CircuitOpen`, `BulkheadFull`, `RateLimited`,
//!   `Cancelled`, pass-through `Inner`)
//! - **Clock**: injectable wall clock, so sliding windows can be tested deterministically
//! - **Stores**: the narrow interfaces the rate limiter and request coalescer use to reach
//!   shared state (Redis in production, memory in tests and single-replica deployments)
//! - **Config**: typed, validated configuration for all primitives
//!
//! The primitives themselves live in `pos-resilience-runtime`.
//!
//! ## Example
//!
//! ```
//! use pos_resilience_core::config::{Environment, ResilienceConfig};
//!
//! let config = ResilienceConfig::for_environment(Environment::Development);
//! assert!(config.validate().is_ok());
//! assert_eq!(config.rate_limit.limit, 100);
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod store;

pub use clock::{Clock, SystemClock};
pub use error::{ConfigError, PoolError, ResilienceError, StoreError};
pub use store::{AdmissionMode, ResultCache, WindowAdmission, WindowRequest, WindowStore};

/// Cancellation token threaded through every blocking call.
///
/// Re-exported so callers do not need a direct `tokio-util` dependency.
pub use tokio_util::sync::CancellationToken;
