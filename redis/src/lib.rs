//! # POS Resilience Redis
//!
//! Redis implementations of the shared-state traits from `pos-resilience-core`:
//!
//! - [`RedisWindowStore`]: sliding-window log on a sorted set per identifier, so every
//!   gateway replica enforces the same rate limit
//! - [`RedisCache`]: JSON values with millisecond expiry, behind the request coalescer
//!
//! Both hold a [`ConnectionManager`], which reconnects on its own; cloning either type
//! is cheap and shares the connection.
//!
//! # Example
//!
//! ```no_run
//! use pos_resilience_core::AdmissionMode;
//! use pos_resilience_redis::{connect, RedisCache, RedisWindowStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let conn = connect("redis://127.0.0.1:6379").await?;
//! let windows = RedisWindowStore::new(conn.clone(), AdmissionMode::Atomic);
//! let cache: RedisCache<Vec<String>> = RedisCache::new(conn);
//! # Ok(())
//! # }
//! ```

mod cache;
mod window_store;

pub use cache::RedisCache;
pub use window_store::RedisWindowStore;

pub use redis::aio::ConnectionManager;

use pos_resilience_core::StoreError;
use redis::{Client, ErrorKind, RedisError};

/// Open a managed connection to `redis_url`.
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] if the URL is invalid or the server cannot be
/// reached.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager, StoreError> {
    let client = Client::open(redis_url)
        .map_err(|e| StoreError::Unavailable(format!("Failed to create Redis client: {e}")))?;

    let manager = ConnectionManager::new(client).await.map_err(|e| {
        StoreError::Unavailable(format!("Failed to create Redis connection manager: {e}"))
    })?;

    tracing::info!("Connected to Redis");
    Ok(manager)
}

/// Classify a Redis failure.
///
/// Anything that means "the server could not be talked to" is `Unavailable`, which the
/// rate limiter fails open on; replies of the wrong shape are `Protocol`.
pub(crate) fn store_error(e: &RedisError) -> StoreError {
    if e.is_io_error()
        || e.is_connection_refusal()
        || e.is_connection_dropped()
        || e.is_timeout()
        || e.kind() == ErrorKind::BusyLoadingError
        || e.kind() == ErrorKind::TryAgain
    {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Protocol(e.to_string())
    }
}
