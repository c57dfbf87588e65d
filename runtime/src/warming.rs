//! Startup cache warming.
//!
//! Preloads hot keys (menus, price lists, store settings) into a [`ResultCache`] before
//! traffic arrives. Warming is best effort: a failed loader or cache write is logged and
//! counted, never fatal.

use futures::future::BoxFuture;
use pos_resilience_core::{CancellationToken, ResultCache};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

type Loader<V, E> = Box<dyn FnOnce() -> BoxFuture<'static, Result<V, E>> + Send>;

/// One key to preload.
pub struct WarmupItem<V, E> {
    /// Cache key
    pub key: String,
    /// TTL for the loaded value
    pub ttl: Duration,
    loader: Loader<V, E>,
}

impl<V, E> WarmupItem<V, E> {
    /// Preload `key` with the value produced by `loader`.
    pub fn new<F, Fut>(key: impl Into<String>, ttl: Duration, loader: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        Self {
            key: key.into(),
            ttl,
            loader: Box::new(move || Box::pin(loader())),
        }
    }
}

impl<V, E> std::fmt::Debug for WarmupItem<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmupItem")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// What a warmup pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmupReport {
    /// Keys loaded and stored
    pub warmed: usize,
    /// Keys already cached
    pub skipped: usize,
    /// Keys whose loader or cache write failed
    pub failed: usize,
}

/// Preloads a cache.
#[derive(Debug)]
pub struct CacheWarmer<C> {
    cache: Arc<C>,
}

impl<C> CacheWarmer<C> {
    /// Warm `cache`.
    #[must_use]
    pub const fn new(cache: Arc<C>) -> Self {
        Self { cache }
    }

    /// Load every item not already cached, in order.
    ///
    /// Stops early, leaving the remaining items untouched, once `token` is cancelled.
    pub async fn warm<V, E>(
        &self,
        token: &CancellationToken,
        items: Vec<WarmupItem<V, E>>,
    ) -> WarmupReport
    where
        V: Send + Sync,
        E: Display,
        C: ResultCache<V>,
    {
        tracing::info!(items = items.len(), "Starting cache warmup");
        let mut report = WarmupReport::default();

        for item in items {
            if token.is_cancelled() {
                tracing::warn!("Cache warmup cancelled");
                break;
            }

            if matches!(self.cache.contains(&item.key).await, Ok(true)) {
                report.skipped += 1;
                continue;
            }

            let value = match (item.loader)().await {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(key = %item.key, error = %e, "Failed to load warmup value");
                    report.failed += 1;
                    continue;
                }
            };

            if let Err(e) = self.cache.set(&item.key, &value, item.ttl).await {
                tracing::warn!(key = %item.key, error = %e, "Failed to store warmup value");
                report.failed += 1;
                continue;
            }

            tracing::debug!(key = %item.key, "Warmed cache key");
            report.warmed += 1;
        }

        tracing::info!(
            warmed = report.warmed,
            skipped = report.skipped,
            failed = report.failed,
            "Cache warmup completed"
        );
        report
    }
}
