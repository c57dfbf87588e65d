//! Shared-state interfaces.
//!
//! The rate limiter and the request coalescer keep their state outside the process so
//! that every replica of a service sees the same view. These traits are the narrow
//! surface they need from that state; `pos-resilience-redis` implements them on Redis and
//! `pos-resilience-runtime` ships in-memory versions.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// How a window store performs the remove → count → record sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionMode {
    /// One server-side operation; the limit holds exactly under concurrent callers.
    #[default]
    Atomic,
    /// Three separate round-trips; may admit slightly more than the limit under races.
    Sequential,
}

/// One admission attempt against a sliding-window log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRequest<'a> {
    /// Fully-qualified store key (prefix included)
    pub key: &'a str,
    /// Request timestamp, milliseconds since the Unix epoch
    pub now_ms: i64,
    /// Trailing window length
    pub window: Duration,
    /// Maximum entries allowed in the window
    pub limit: u64,
    /// Unique member recorded for this request
    pub member: &'a str,
}

impl WindowRequest<'_> {
    /// Entries scored strictly below this are outside the window.
    #[must_use]
    pub fn window_start_ms(&self) -> i64 {
        self.now_ms.saturating_sub(window_millis(self.window))
    }
}

/// Outcome of [`WindowStore::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAdmission {
    /// Whether the request was admitted (and recorded)
    pub admitted: bool,
    /// Live entries in the window before this request
    pub count: u64,
}

/// Window length in whole milliseconds, saturating at `i64::MAX`.
#[must_use]
pub fn window_millis(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX)
}

/// Per-key sliding-window log of request timestamps.
///
/// Implementations must be safe to call concurrently from many tasks and, for shared
/// backends, from many processes.
pub trait WindowStore: Send + Sync {
    /// Drop every entry scored strictly below `cutoff_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be reached.
    fn remove_before(
        &self,
        key: &str,
        cutoff_ms: i64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Number of entries currently held for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be reached.
    fn count(&self, key: &str) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Add an entry scored `ts_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be reached.
    fn record(
        &self,
        key: &str,
        ts_ms: i64,
        member: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Set (or refresh) the time-to-live of the whole log for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be reached.
    fn expire(&self, key: &str, ttl: Duration)
    -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Forget every entry for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be reached.
    fn clear(&self, key: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remove expired entries, count, and record the request if under the limit.
    ///
    /// The provided implementation issues the three steps as separate operations, so
    /// concurrent callers for the same key can slightly over-admit. Backends that can do
    /// better override it.
    ///
    /// # Errors
    ///
    /// Returns the first [`StoreError`] hit along the way.
    fn admit(
        &self,
        request: &WindowRequest<'_>,
    ) -> impl Future<Output = Result<WindowAdmission, StoreError>> + Send {
        admit_sequential(self, request)
    }
}

/// The remove → count → record → expire sequence as separate store operations.
///
/// This is what [`WindowStore::admit`] does unless a backend overrides it; backends that
/// offer a configurable mode call it directly for their non-atomic path.
///
/// # Errors
///
/// Returns the first [`StoreError`] hit along the way.
pub async fn admit_sequential<S>(
    store: &S,
    request: &WindowRequest<'_>,
) -> Result<WindowAdmission, StoreError>
where
    S: WindowStore + ?Sized,
{
    store
        .remove_before(request.key, request.window_start_ms())
        .await?;
    let count = store.count(request.key).await?;
    if count >= request.limit {
        return Ok(WindowAdmission {
            admitted: false,
            count,
        });
    }
    store
        .record(request.key, request.now_ms, request.member)
        .await?;
    store.expire(request.key, request.window).await?;
    Ok(WindowAdmission {
        admitted: true,
        count,
    })
}

/// Key → value cache with per-entry TTL.
///
/// Read failures are reported so callers can treat them as misses; the coalescer never
/// fails a call because the cache misbehaved.
pub trait ResultCache<V>: Send + Sync
where
    V: Send + Sync,
{
    /// Live value for `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the cache cannot be read or the value cannot be decoded.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<V>, StoreError>> + Send;

    /// Store `value` under `key` for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the cache cannot be written.
    fn set(
        &self,
        key: &str,
        value: &V,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Drop `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the cache cannot be written.
    fn invalidate(&self, key: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Whether a live entry exists for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the cache cannot be read.
    fn contains(&self, key: &str) -> impl Future<Output = Result<bool, StoreError>> + Send {
        async move { Ok(self.get(key).await?.is_some()) }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Bare-bones store: exercises the provided `admit` sequence.
    #[derive(Default)]
    struct VecStore {
        entries: Mutex<HashMap<String, Vec<i64>>>,
    }

    impl WindowStore for VecStore {
        async fn remove_before(&self, key: &str, cutoff_ms: i64) -> Result<(), StoreError> {
            if let Some(log) = self.entries.lock().unwrap().get_mut(key) {
                log.retain(|ts| *ts >= cutoff_ms);
            }
            Ok(())
        }

        async fn count(&self, key: &str) -> Result<u64, StoreError> {
            Ok(self
                .entries
                .lock()
                .unwrap()
                .get(key)
                .map_or(0, |log| log.len() as u64))
        }

        async fn record(&self, key: &str, ts_ms: i64, _member: &str) -> Result<(), StoreError> {
            self.entries
                .lock()
                .unwrap()
                .entry(key.to_string())
                .or_default()
                .push(ts_ms);
            Ok(())
        }

        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), StoreError> {
            Ok(())
        }

        async fn clear(&self, key: &str) -> Result<(), StoreError> {
            self.entries.lock().unwrap().remove(key);
            Ok(())
        }
    }

    fn request(now_ms: i64) -> WindowRequest<'static> {
        WindowRequest {
            key: "ratelimit:client",
            now_ms,
            window: Duration::from_secs(1),
            limit: 2,
            member: "m",
        }
    }

    #[tokio::test]
    async fn test_default_admit_enforces_limit() {
        let store = VecStore::default();

        assert!(store.admit(&request(1_000)).await.unwrap().admitted);
        assert!(store.admit(&request(1_100)).await.unwrap().admitted);

        let denied = store.admit(&request(1_200)).await.unwrap();
        assert!(!denied.admitted);
        assert_eq!(denied.count, 2);
        // Denied requests are not recorded
        assert_eq!(store.count("ratelimit:client").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_default_admit_slides_window() {
        let store = VecStore::default();
        store.admit(&request(1_000)).await.unwrap();
        store.admit(&request(1_500)).await.unwrap();

        // Entry at exactly now - window is still inside the window
        assert!(!store.admit(&request(2_000)).await.unwrap().admitted);
        // 1_000 has now slid out
        assert!(store.admit(&request(2_001)).await.unwrap().admitted);
    }

    #[test]
    fn test_window_start_saturates() {
        let req = WindowRequest {
            window: Duration::MAX,
            ..request(0)
        };
        assert_eq!(req.window_start_ms(), -i64::MAX);
    }

    #[test]
    fn test_admission_mode_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: AdmissionMode,
        }
        let parsed: Wrapper = toml::from_str("mode = \"sequential\"").unwrap();
        assert_eq!(parsed.mode, AdmissionMode::Sequential);
        assert_eq!(AdmissionMode::default(), AdmissionMode::Atomic);
    }
}
