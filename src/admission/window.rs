//! In-memory sliding-window counter store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::error::Result;

use super::store::{AdmissionResult, WindowStore};

/// Extra idle time an entry survives past its period before eviction.
const EVICTION_GRACE: Duration = Duration::from_secs(60);

/// Recent event timestamps for one key, oldest first.
#[derive(Debug)]
struct WindowEntry {
    timestamps: Vec<DateTime<Utc>>,
    period: Duration,
    last_seen: DateTime<Utc>,
}

/// A keyed, expiring store of recent event timestamps.
///
/// Entries are created lazily on first event and evicted after
/// `period + grace` of inactivity, so no key holds state forever. All
/// mutation for a key happens under that key's dashmap shard lock; there
/// is no process-wide lock, and unrelated keys never contend.
pub struct InMemoryWindowStore {
    windows: DashMap<String, WindowEntry>,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Check the window for `key` and record an event at `now` if a slot
    /// is free.
    ///
    /// The entire fetch-prune-append sequence runs under the entry guard,
    /// so two concurrent requests sharing a key can never both observe the
    /// same pre-increment count. There is no await inside the guard, which
    /// also makes the check transactional under cancellation: either the
    /// timestamp is recorded and a decision produced, or neither happened.
    pub fn check_and_record_sync(
        &self,
        key: &str,
        limit: u32,
        period: Duration,
        now: DateTime<Utc>,
    ) -> AdmissionResult {
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| {
                trace!(key = %key, limit = limit, "Creating new window entry");
                WindowEntry {
                    timestamps: Vec::new(),
                    period,
                    last_seen: now,
                }
            });

        entry.period = period;
        entry.last_seen = now;

        let cutoff = now - period;
        entry.timestamps.retain(|t| *t >= cutoff);

        let count = entry.timestamps.len() as u32;
        if count >= limit {
            // Timestamps are appended in order, so the first survivor is
            // the oldest; the window frees a slot when it ages out.
            let oldest = entry.timestamps.first().copied().unwrap_or(now);
            let reset_at = oldest + period;
            let retry_after = (reset_at - now).to_std().unwrap_or_default();
            debug!(key = %key, limit = limit, "Window limit exceeded");
            return AdmissionResult {
                allowed: false,
                limit,
                remaining: 0,
                reset_at,
                retry_after: Some(retry_after),
                violated_tier: None,
            };
        }

        entry.timestamps.push(now);
        AdmissionResult {
            allowed: true,
            limit,
            remaining: limit - (count + 1),
            reset_at: now + period,
            retry_after: None,
            violated_tier: None,
        }
    }

    /// Drop entries idle longer than `period + grace` to bound memory.
    pub fn evict_expired(&self, now: DateTime<Utc>) {
        let before = self.windows.len();
        self.windows
            .retain(|_, entry| entry.last_seen + entry.period + EVICTION_GRACE > now);
        let evicted = before - self.windows.len();
        if evicted > 0 {
            debug!(evicted = evicted, remaining = self.windows.len(), "Evicted idle windows");
        }
    }

    /// Number of live window entries.
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Clear all windows. Primarily useful for testing.
    pub fn clear(&self) {
        self.windows.clear();
    }
}

impl Default for InMemoryWindowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    async fn check_and_record(
        &self,
        key: &str,
        limit: u32,
        period: Duration,
        now: DateTime<Utc>,
    ) -> Result<AdmissionResult> {
        Ok(self.check_and_record_sync(key, limit, period, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_admits_up_to_limit() {
        let store = InMemoryWindowStore::new();
        let now = Utc::now();

        for expected_remaining in (0..5).rev() {
            let result = store.check_and_record_sync("k", 5, MINUTE, now);
            assert!(result.allowed);
            assert_eq!(result.limit, 5);
            assert_eq!(result.remaining, expected_remaining);
            assert_eq!(result.retry_after, None);
        }
    }

    #[test]
    fn test_denies_past_limit_with_retry_after() {
        let store = InMemoryWindowStore::new();
        let now = Utc::now();

        for _ in 0..3 {
            store.check_and_record_sync("k", 3, MINUTE, now);
        }
        let result = store.check_and_record_sync("k", 3, MINUTE, now + Duration::from_secs(10));
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        // Oldest event was at `now`, so the slot frees 50s after the check.
        assert_eq!(result.retry_after, Some(Duration::from_secs(50)));
        assert_eq!(result.reset_at, now + MINUTE);
    }

    #[test]
    fn test_window_slides_and_admits_again() {
        let store = InMemoryWindowStore::new();
        let now = Utc::now();

        for _ in 0..2 {
            store.check_and_record_sync("k", 2, MINUTE, now);
        }
        let denied = store.check_and_record_sync("k", 2, MINUTE, now + Duration::from_secs(30));
        assert!(!denied.allowed);

        // Past the reset point the oldest event has aged out.
        let result = store.check_and_record_sync("k", 2, MINUTE, now + Duration::from_secs(61));
        assert!(result.allowed);
    }

    #[test]
    fn test_keys_are_independent() {
        let store = InMemoryWindowStore::new();
        let now = Utc::now();

        let denied = {
            store.check_and_record_sync("a", 1, MINUTE, now);
            store.check_and_record_sync("a", 1, MINUTE, now)
        };
        assert!(!denied.allowed);

        let other = store.check_and_record_sync("b", 1, MINUTE, now);
        assert!(other.allowed);
    }

    #[test]
    fn test_eviction_drops_idle_entries() {
        let store = InMemoryWindowStore::new();
        let now = Utc::now();

        store.check_and_record_sync("stale", 5, MINUTE, now);
        store.check_and_record_sync("fresh", 5, MINUTE, now + Duration::from_secs(100));
        assert_eq!(store.window_count(), 2);

        // "stale" has been idle past period + grace; "fresh" has not.
        store.evict_expired(now + Duration::from_secs(121));
        assert_eq!(store.window_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_checks_never_over_admit() {
        let store = Arc::new(InMemoryWindowStore::new());
        let now = Utc::now();
        let limit = 10u32;
        let tasks = 50usize;

        let mut handles = Vec::with_capacity(tasks);
        for _ in 0..tasks {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .check_and_record("shared", limit, MINUTE, now)
                    .await
                    .unwrap()
            }));
        }

        let mut admitted = 0;
        let mut denied = 0;
        for handle in handles {
            let result = handle.await.unwrap();
            if result.allowed {
                admitted += 1;
            } else {
                denied += 1;
            }
        }

        assert_eq!(admitted, limit as usize);
        assert_eq!(denied, tasks - limit as usize);
    }
}
