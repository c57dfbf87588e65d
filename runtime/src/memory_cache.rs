//! Bounded in-process result cache.
//!
//! Backs the [`RequestCoalescer`](crate::coalescer::RequestCoalescer) when no shared cache
//! is configured.
//!
//! ## Features
//!
//! - **TTL per entry**: each `set` carries its own time-to-live
//! - **LRU eviction**: least-recently-used entry goes first once `max_entries` is reached
//! - **Tokio time**: expiry follows `tokio::time`, so paused-clock tests drive it

use parking_lot::Mutex;
use pos_resilience_core::config::CoalescerSettings;
use pos_resilience_core::{ResultCache, StoreError};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct CachedEntry<V> {
    value: V,
    /// `None` when `now + ttl` is past what `Instant` can represent
    expires_at: Option<Instant>,
    /// Access sequence number; lower means colder
    last_accessed: u64,
}

impl<V> CachedEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug)]
struct CacheInner<V> {
    entries: HashMap<String, CachedEntry<V>>,
    tick: u64,
}

impl<V> CacheInner<V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn evict_expired(&mut self, now: Instant) {
        self.entries.retain(|_, entry| !entry.is_expired(now));
    }

    fn evict_lru(&mut self) {
        let coldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(key, _)| key.clone());
        if let Some(key) = coldest {
            self.entries.remove(&key);
        }
    }
}

/// In-memory TTL cache with LRU eviction.
#[derive(Debug)]
pub struct MemoryCache<V> {
    max_entries: usize,
    inner: Mutex<CacheInner<V>>,
}

impl<V: Clone> MemoryCache<V> {
    /// Create a cache holding at most `max_entries` live entries (at least one).
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                tick: 0,
            }),
        }
    }

    /// Sized from configuration.
    #[must_use]
    pub fn from_settings(settings: &CoalescerSettings) -> Self {
        Self::new(settings.max_entries)
    }

    /// Live value for `key`, refreshing its recency.
    pub fn lookup(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let tick = inner.next_tick();

        match inner.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.last_accessed = tick;
                return Some(entry.value.clone());
            }
            Some(_) => {}
            None => return None,
        }
        inner.entries.remove(key);
        None
    }

    /// Store `value` under `key` for `ttl`, evicting if full.
    pub fn insert(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let tick = inner.next_tick();

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_entries {
            inner.evict_expired(now);
            if inner.entries.len() >= self.max_entries {
                inner.evict_lru();
            }
        }

        inner.entries.insert(
            key,
            CachedEntry {
                value,
                expires_at: now.checked_add(ttl),
                last_accessed: tick,
            },
        );
    }

    /// Drop `key`.
    pub fn remove(&self, key: &str) {
        self.inner.lock().entries.remove(key);
    }

    /// Drop every expired entry now rather than on next access.
    pub fn purge_expired(&self) {
        self.inner.lock().evict_expired(Instant::now());
    }

    /// Get cache statistics
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.inner.lock().entries.len(),
            capacity: self.max_entries,
        }
    }
}

/// Cache statistics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheStats {
    /// Current size, expired entries not yet purged included
    pub size: usize,
    /// Maximum capacity
    pub capacity: usize,
}

impl<V> ResultCache<V> for MemoryCache<V>
where
    V: Clone + Send + Sync,
{
    async fn get(&self, key: &str) -> Result<Option<V>, StoreError> {
        Ok(self.lookup(key))
    }

    async fn set(&self, key: &str, value: &V, ttl: Duration) -> Result<(), StoreError> {
        self.insert(key, value.clone(), ttl);
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<(), StoreError> {
        self.remove(key);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_basic() {
        let cache = MemoryCache::new(2);
        cache.insert("sku:1", "espresso".to_string(), Duration::from_secs(60));

        assert_eq!(cache.lookup("sku:1").as_deref(), Some("espresso"));
        assert_eq!(cache.lookup("sku:2"), None);
    }

    #[test]
    fn test_cache_lru_eviction() {
        let cache = MemoryCache::new(2);
        cache.insert("key1", 1, Duration::from_secs(60));
        cache.insert("key2", 2, Duration::from_secs(60));

        // Access key1 to make it more recent
        assert_eq!(cache.lookup("key1"), Some(1));

        // key2 is now the coldest
        cache.insert("key3", 3, Duration::from_secs(60));

        assert_eq!(cache.lookup("key1"), Some(1));
        assert_eq!(cache.lookup("key2"), None);
        assert_eq!(cache.lookup("key3"), Some(3));
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = MemoryCache::new(2);
        cache.insert("a", 1, Duration::from_secs(60));
        cache.insert("b", 2, Duration::from_secs(60));
        cache.insert("a", 10, Duration::from_secs(60));

        assert_eq!(cache.lookup("a"), Some(10));
        assert_eq!(cache.lookup("b"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_ttl() {
        let cache = MemoryCache::new(10);
        cache.insert("short", 1, Duration::from_millis(100));
        cache.insert("long", 2, Duration::from_secs(10));

        tokio::time::advance(Duration::from_millis(99)).await;
        assert_eq!(cache.lookup("short"), Some(1));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.lookup("short"), None);
        assert_eq!(cache.lookup("long"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_make_room_before_lru() {
        let cache = MemoryCache::new(2);
        cache.insert("stale", 1, Duration::from_millis(10));
        cache.insert("hot", 2, Duration::from_secs(60));
        tokio::time::advance(Duration::from_millis(20)).await;

        cache.insert("new", 3, Duration::from_secs(60));

        assert_eq!(cache.lookup("hot"), Some(2));
        assert_eq!(cache.lookup("new"), Some(3));
    }

    #[tokio::test]
    async fn test_result_cache_impl() {
        let cache = MemoryCache::from_settings(&CoalescerSettings::default());

        cache
            .set("menu", &vec!["latte"], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(cache.contains("menu").await.unwrap());

        cache.invalidate("menu").await.unwrap();
        assert_eq!(cache.get("menu").await.unwrap(), None);
        assert_eq!(cache.stats().capacity, 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_ttl_never_expires() {
        let cache = MemoryCache::new(4);
        cache.insert("catalogue", 7, Duration::MAX);
        cache.insert("promo", 1, Duration::from_millis(5));
        tokio::time::advance(Duration::from_secs(86_400 * 365)).await;

        cache.purge_expired();
        assert_eq!(cache.lookup("catalogue"), Some(7));
        assert_eq!(cache.lookup("promo"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = MemoryCache::new(4);
        cache.insert("a", 1, Duration::from_millis(5));
        cache.insert("b", 2, Duration::from_secs(5));
        tokio::time::advance(Duration::from_millis(10)).await;

        cache.purge_expired();
        assert_eq!(
            cache.stats(),
            CacheStats {
                size: 1,
                capacity: 4
            }
        );
    }
}
