//! Request coalescing (single-flight) in front of a result cache.
//!
//! Prevents cache stampedes: when many callers miss the cache for the same key at
//! once, exactly one of them (the leader) runs the fallback and every other caller
//! waits for and shares its result.
//!
//! ```text
//!  caller A ──miss──► leader ──► fallback() ──► cache.set ──┐
//!  caller B ──miss──► join ─────────────────────────────────┼──► same Result
//!  caller C ──miss──► join ─────────────────────────────────┘
//! ```
//!
//! The cache never fails a call: read errors count as misses and write errors are
//! logged, the freshly computed value is still returned.
//!
//! A flight lives only as long as someone is waiting on it. If every waiter is dropped
//! the fallback is abandoned and the next caller starts a new flight. A panicking
//! fallback panics every waiter of that flight.

use crate::metrics::CoalescerMetrics;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use pos_resilience_core::config::CoalescerSettings;
use pos_resilience_core::{ResultCache, StoreError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

type Flight<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

struct InFlight<V, E> {
    generation: u64,
    flight: WeakShared<BoxFuture<'static, Result<V, E>>>,
}

type FlightMap<V, E> = Arc<Mutex<HashMap<String, InFlight<V, E>>>>;

/// Removes a flight from the map when its future finishes or is dropped.
///
/// Only the flight that registered itself is removed; a newer flight for the same key
/// is left alone.
struct FlightCleanup<V, E> {
    flights: FlightMap<V, E>,
    key: String,
    generation: u64,
}

impl<V, E> Drop for FlightCleanup<V, E> {
    fn drop(&mut self) {
        let mut flights = self.flights.lock();
        if flights
            .get(&self.key)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            flights.remove(&self.key);
        }
    }
}

/// Single-flight loader over a [`ResultCache`].
pub struct RequestCoalescer<V, E, C> {
    name: String,
    cache: Arc<C>,
    default_ttl: Duration,
    flights: FlightMap<V, E>,
    next_generation: AtomicU64,
}

impl<V, E, C> std::fmt::Debug for RequestCoalescer<V, E, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoalescer")
            .field("name", &self.name)
            .field("default_ttl", &self.default_ttl)
            .field("in_flight", &self.flights.lock().len())
            .finish_non_exhaustive()
    }
}

impl<V, E, C> RequestCoalescer<V, E, C>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    C: ResultCache<V> + 'static,
{
    /// Create a coalescer that owns its cache.
    #[must_use]
    pub fn new(name: impl Into<String>, cache: C) -> Self {
        Self::with_shared_cache(name, Arc::new(cache))
    }

    /// Create a coalescer over a cache shared with other components.
    #[must_use]
    pub fn with_shared_cache(name: impl Into<String>, cache: Arc<C>) -> Self {
        Self {
            name: name.into(),
            cache,
            default_ttl: CoalescerSettings::default().ttl(),
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// TTL used by [`RequestCoalescer::get_or_fetch`].
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Return the cached value for `key`, or compute it once with `fallback` and cache it
    /// for `ttl`.
    ///
    /// Concurrent callers for the same key share one `fallback` invocation and observe
    /// the same result, error included. Errors are not cached.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `fallback`.
    pub async fn get_with_fallback<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fallback: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        match self.cache.get(key).await {
            Ok(Some(value)) => {
                CoalescerMetrics::record_hit(&self.name);
                return Ok(value);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    coalescer = %self.name,
                    key = %key,
                    error = %e,
                    "Cache read failed, treating as miss"
                );
            }
        }
        CoalescerMetrics::record_miss(&self.name);

        self.join_or_lead(key, ttl, fallback).await
    }

    /// [`RequestCoalescer::get_with_fallback`] with the default TTL.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `fallback`.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fallback: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        self.get_with_fallback(key, self.default_ttl, fallback)
            .await
    }

    /// Drop the cached value for `key`. An in-flight computation is not affected.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the cache cannot be written.
    pub async fn invalidate(&self, key: &str) -> Result<(), StoreError> {
        self.cache.invalidate(key).await?;
        tracing::debug!(coalescer = %self.name, key = %key, "Invalidated cache entry");
        Ok(())
    }

    /// Number of keys with a computation in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }

    /// The underlying cache.
    #[must_use]
    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Coalescer name used in logs and metrics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn join_or_lead<F, Fut>(&self, key: &str, ttl: Duration, fallback: F) -> Flight<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let mut flights = self.flights.lock();

        if let Some(flight) = flights.get(key).and_then(|entry| entry.flight.upgrade()) {
            CoalescerMetrics::record_coalesced(&self.name);
            tracing::debug!(coalescer = %self.name, key = %key, "Joined in-flight request");
            return flight;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let flight = self.lead(key.to_string(), generation, ttl, fallback);
        if let Some(weak) = flight.downgrade() {
            flights.insert(
                key.to_string(),
                InFlight {
                    generation,
                    flight: weak,
                },
            );
        }
        flight
    }

    fn lead<F, Fut>(&self, key: String, generation: u64, ttl: Duration, fallback: F) -> Flight<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let cache = Arc::clone(&self.cache);
        let name = self.name.clone();
        let cleanup = FlightCleanup {
            flights: Arc::clone(&self.flights),
            key,
            generation,
        };

        async move {
            let cleanup = cleanup;
            let key = cleanup.key.as_str();

            // Another leader may have filled the cache since our miss
            if let Ok(Some(value)) = cache.get(key).await {
                CoalescerMetrics::record_hit(&name);
                return Ok(value);
            }

            CoalescerMetrics::record_fallback(&name);
            let result = fallback().await;

            if let Ok(value) = &result {
                if let Err(e) = cache.set(key, value, ttl).await {
                    CoalescerMetrics::record_set_failure(&name);
                    tracing::warn!(
                        coalescer = %name,
                        key = %key,
                        error = %e,
                        "Failed to cache computed value, returning it anyway"
                    );
                }
            }
            result
        }
        .boxed()
        .shared()
    }
}
