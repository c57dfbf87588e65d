//! In-process [`WindowStore`].
//!
//! For single-replica deployments and tests. Limits enforced through this store hold
//! only within one process.
//!
//! Key expiry is tracked in the same millisecond domain as the request timestamps, so a
//! test clock drives it too. Expired keys are dropped when next accessed, and `admit`
//! sweeps the whole map at most once per window so keys that are never seen again are
//! still reclaimed. [`MemoryWindowStore::sweep`] does the same on demand.

use parking_lot::Mutex;
use pos_resilience_core::store::window_millis;
use pos_resilience_core::{StoreError, WindowAdmission, WindowRequest, WindowStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct WindowLog {
    /// (score, member), in insertion order
    entries: Vec<(i64, String)>,
    expires_at_ms: Option<i64>,
}

impl WindowLog {
    fn remove_before(&mut self, cutoff_ms: i64) {
        self.entries.retain(|(ts, _)| *ts >= cutoff_ms);
    }

    fn record(&mut self, ts_ms: i64, member: &str) {
        if let Some(existing) = self.entries.iter_mut().find(|(_, m)| m == member) {
            existing.0 = ts_ms;
        } else {
            self.entries.push((ts_ms, member.to_string()));
        }
    }

    fn newest(&self) -> Option<i64> {
        self.entries.iter().map(|(ts, _)| *ts).max()
    }

    fn expire(&mut self, ttl: Duration) {
        self.expires_at_ms = self
            .newest()
            .map(|newest| newest.saturating_add(window_millis(ttl)));
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

/// Sliding-window logs held in process memory.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryWindowStore {
    logs: Arc<Mutex<HashMap<String, WindowLog>>>,
    /// Earliest `now_ms` at which `admit` sweeps again; only touched under `logs`
    next_sweep_ms: Arc<AtomicI64>,
}

impl MemoryWindowStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every key whose expiry is at or before `now_ms`. Returns how many were removed.
    pub fn sweep(&self, now_ms: i64) -> usize {
        Self::retain_live(&mut self.logs.lock(), now_ms)
    }

    fn retain_live(logs: &mut HashMap<String, WindowLog>, now_ms: i64) -> usize {
        let before = logs.len();
        logs.retain(|_, log| !log.is_expired(now_ms));
        before - logs.len()
    }

    /// Number of keys held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.logs.lock().len()
    }

    /// Whether no keys are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.logs.lock().is_empty()
    }
}

impl WindowStore for MemoryWindowStore {
    async fn remove_before(&self, key: &str, cutoff_ms: i64) -> Result<(), StoreError> {
        if let Some(log) = self.logs.lock().get_mut(key) {
            log.remove_before(cutoff_ms);
        }
        Ok(())
    }

    async fn count(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self
            .logs
            .lock()
            .get(key)
            .map_or(0, |log| log.entries.len() as u64))
    }

    async fn record(&self, key: &str, ts_ms: i64, member: &str) -> Result<(), StoreError> {
        self.logs
            .lock()
            .entry(key.to_string())
            .or_default()
            .record(ts_ms, member);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        if let Some(log) = self.logs.lock().get_mut(key) {
            log.expire(ttl);
        }
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.logs.lock().remove(key);
        Ok(())
    }

    /// The whole sequence runs under one lock, so the limit is exact within the process.
    async fn admit(&self, request: &WindowRequest<'_>) -> Result<WindowAdmission, StoreError> {
        let mut logs = self.logs.lock();
        if request.now_ms >= self.next_sweep_ms.load(Ordering::Relaxed) {
            let swept = Self::retain_live(&mut logs, request.now_ms);
            if swept > 0 {
                tracing::debug!(swept, remaining = logs.len(), "Swept expired rate-limit windows");
            }
            self.next_sweep_ms.store(
                request.now_ms.saturating_add(window_millis(request.window)),
                Ordering::Relaxed,
            );
        }
        if logs
            .get(request.key)
            .is_some_and(|log| log.is_expired(request.now_ms))
        {
            logs.remove(request.key);
        }

        let log = logs.entry(request.key.to_string()).or_default();
        log.remove_before(request.window_start_ms());
        let count = log.entries.len() as u64;
        if count >= request.limit {
            if log.entries.is_empty() {
                logs.remove(request.key);
            }
            return Ok(WindowAdmission {
                admitted: false,
                count,
            });
        }

        log.record(request.now_ms, request.member);
        log.expire(request.window);
        Ok(WindowAdmission {
            admitted: true,
            count,
        })
    }
}
