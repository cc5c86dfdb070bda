//! Window store trait for abstracting over counter backends.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// The outcome of a single window check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionResult {
    pub allowed: bool,
    /// The limit of the window that produced this result
    pub limit: u32,
    /// Slots left in the window, always within `0..=limit`
    pub remaining: u32,
    /// When the quota replenishes (upper bound when admitted)
    pub reset_at: DateTime<Utc>,
    /// How long to wait before retrying; present iff denied
    pub retry_after: Option<Duration>,
    /// Tag of the tier that denied the request; filled in by the engine
    pub violated_tier: Option<String>,
}

/// Trait for sliding-window counter stores.
///
/// This is the seam between the admission engine and the counter state, so
/// a shared-cache backend can replace the in-memory store without touching
/// tier evaluation.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Check the window for `key` and, if a slot is free, record an event
    /// at `now`. The fetch-prune-append sequence must be atomic with
    /// respect to concurrent calls sharing a key.
    async fn check_and_record(
        &self,
        key: &str,
        limit: u32,
        period: Duration,
        now: DateTime<Utc>,
    ) -> Result<AdmissionResult>;
}
