//! Redis sliding-window log.
//!
//! Each identifier's log is a sorted set scored by request time in milliseconds:
//!
//! 1. `ZREMRANGEBYSCORE key -inf (cutoff` drops entries older than the window
//! 2. `ZCARD key` counts what is left
//! 3. `ZADD key now member` records the request (members are unique per request)
//! 4. `PEXPIRE key window` lets idle identifiers disappear
//!
//! In [`AdmissionMode::Atomic`] the four steps run as one Lua script, so the limit is
//! exact across replicas. [`AdmissionMode::Sequential`] issues them as separate
//! round-trips and can over-admit slightly under concurrent requests for one key.

use crate::store_error;
use pos_resilience_core::store::{admit_sequential, window_millis};
use pos_resilience_core::{AdmissionMode, StoreError, WindowAdmission, WindowRequest, WindowStore};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;

/// KEYS[1] = log key
/// ARGV = cutoff_ms, now_ms, limit, member, window_ms
/// Returns {admitted (0|1), count before this request}
const ADMIT_SCRIPT: &str = r"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
local count = redis.call('ZCARD', KEYS[1])
if count >= tonumber(ARGV[3]) then
    return {0, count}
end
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[4])
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return {1, count}
";

/// [`WindowStore`] on Redis sorted sets.
#[derive(Clone)]
pub struct RedisWindowStore {
    conn: ConnectionManager,
    mode: AdmissionMode,
    script: Script,
}

impl std::fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWindowStore")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl RedisWindowStore {
    /// Use `conn` with the given admission mode.
    #[must_use]
    pub fn new(conn: ConnectionManager, mode: AdmissionMode) -> Self {
        Self {
            conn,
            mode,
            script: Script::new(ADMIT_SCRIPT),
        }
    }

    /// Admission mode in effect.
    #[must_use]
    pub const fn mode(&self) -> AdmissionMode {
        self.mode
    }

    async fn admit_atomic(&self, request: &WindowRequest<'_>) -> Result<WindowAdmission, StoreError> {
        let mut conn = self.conn.clone();
        let (admitted, count): (i64, u64) = self
            .script
            .key(request.key)
            .arg(request.window_start_ms())
            .arg(request.now_ms)
            .arg(request.limit)
            .arg(request.member)
            .arg(window_millis(request.window))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                tracing::warn!(key = %request.key, error = %e, "Rate limit script failed");
                store_error(&e)
            })?;

        Ok(WindowAdmission {
            admitted: admitted == 1,
            count,
        })
    }
}

/// Exclusive upper bound in `ZRANGEBYSCORE` syntax.
fn exclusive(score: i64) -> String {
    format!("({score}")
}

impl WindowStore for RedisWindowStore {
    async fn remove_before(&self, key: &str, cutoff_ms: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zrembyscore(key, "-inf", exclusive(cutoff_ms))
            .await
            .map_err(|e| store_error(&e))?;
        Ok(())
    }

    async fn count(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        conn.zcard(key).await.map_err(|e| store_error(&e))
    }

    async fn record(&self, key: &str, ts_ms: i64, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zadd(key, member, ts_ms)
            .await
            .map_err(|e| store_error(&e))?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .pexpire(key, window_millis(ttl))
            .await
            .map_err(|e| store_error(&e))?;
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await.map_err(|e| store_error(&e))?;
        Ok(())
    }

    async fn admit(&self, request: &WindowRequest<'_>) -> Result<WindowAdmission, StoreError> {
        match self.mode {
            AdmissionMode::Atomic => self.admit_atomic(request).await,
            AdmissionMode::Sequential => admit_sequential(self, request).await,
        }
    }
}
