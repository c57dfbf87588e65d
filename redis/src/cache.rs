//! Redis result cache.
//!
//! Values are stored as JSON strings under `{prefix}:{key}` with `SET .. PX ttl`.

use crate::store_error;
use pos_resilience_core::{ResultCache, StoreError};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::time::Duration;

/// [`ResultCache`] storing JSON-encoded `V` in Redis.
pub struct RedisCache<V> {
    conn: ConnectionManager,
    prefix: String,
    _value: PhantomData<fn() -> V>,
}

impl<V> Clone for RedisCache<V> {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            prefix: self.prefix.clone(),
            _value: PhantomData,
        }
    }
}

impl<V> std::fmt::Debug for RedisCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl<V> RedisCache<V> {
    /// Cache under the default `cache` prefix.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self::with_prefix(conn, "cache")
    }

    /// Cache under `prefix`.
    #[must_use]
    pub fn with_prefix(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            _value: PhantomData,
        }
    }

    fn key(&self, key: &str) -> String {
        cache_key(&self.prefix, key)
    }
}

fn cache_key(prefix: &str, key: &str) -> String {
    format!("{prefix}:{key}")
}

/// Redis rejects `PX 0`; round sub-millisecond TTLs up.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl<V> ResultCache<V> for RedisCache<V>
where
    V: Serialize + DeserializeOwned + Send + Sync,
{
    async fn get(&self, key: &str) -> Result<Option<V>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(self.key(key))
            .await
            .map_err(|e| store_error(&e))?;

        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| {
                StoreError::Serialization(format!("Failed to decode cached value for {key}: {e}"))
            })
        })
        .transpose()
    }

    async fn set(&self, key: &str, value: &V, ttl: Duration) -> Result<(), StoreError> {
        let json = serde_json::to_string(value).map_err(|e| {
            StoreError::Serialization(format!("Failed to encode value for {key}: {e}"))
        })?;

        let mut conn = self.conn.clone();
        let _: () = conn
            .pset_ex(self.key(key), json, ttl_millis(ttl))
            .await
            .map_err(|e| store_error(&e))?;
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.key(key)).await.map_err(|e| store_error(&e))?;
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        conn.exists(self.key(key)).await.map_err(|e| store_error(&e))
    }
}
