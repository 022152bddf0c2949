//! Rebuild queue entry and claim policy.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use sheetcache_core::{SnapshotKey, WorkerId};

/// A claim older than this is stale and may be taken over by any worker.
pub const CLAIM_TTL_SECS: i64 = 5 * 60;

/// Maximum stored length (in characters) of an enqueue reason.
pub const REASON_MAX_CHARS: usize = 100;

pub fn claim_ttl() -> Duration {
    Duration::seconds(CLAIM_TTL_SECS)
}

/// One pending rebuild request. At most one entry exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub key: SnapshotKey,
    pub enqueued_at: DateTime<Utc>,
    /// Diagnostic only; never branched on.
    pub reason: Option<String>,
    /// Incremented every time the entry is claimed.
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<WorkerId>,
}

impl QueueEntry {
    /// A fresh, unclaimed entry.
    pub fn new(key: SnapshotKey, reason: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            key,
            enqueued_at: now,
            reason,
            attempts: 0,
            last_attempt_at: None,
            claimed_at: None,
            claimed_by: None,
        }
    }

    /// Unclaimed, or claimed longer ago than the claim TTL.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.claimed_at {
            None => true,
            Some(at) => at < now - claim_ttl(),
        }
    }

    pub fn is_claimed_by(&self, worker_id: &WorkerId) -> bool {
        self.claimed_by.as_ref() == Some(worker_id)
    }

    pub(crate) fn mark_claimed(&mut self, worker_id: &WorkerId, now: DateTime<Utc>) {
        self.claimed_at = Some(now);
        self.claimed_by = Some(worker_id.clone());
        self.attempts += 1;
        self.last_attempt_at = Some(now);
    }

    pub(crate) fn clear_claim(&mut self) {
        self.claimed_at = None;
        self.claimed_by = None;
    }

    /// Fresh mutation wins over any in-flight claim.
    pub(crate) fn refresh(&mut self, reason: Option<String>, now: DateTime<Utc>) {
        self.enqueued_at = now;
        self.reason = reason;
        self.clear_claim();
    }
}

/// Normalize an enqueue reason for storage (blank becomes `None`).
pub fn normalize_reason(reason: &str) -> Option<String> {
    let trimmed = reason.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(sheetcache_core::truncate_chars(trimmed, REASON_MAX_CHARS).to_string())
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub unclaimed: usize,
    pub claimed: usize,
    pub stale: usize,
}

impl QueueStats {
    pub fn pending(&self) -> usize {
        self.unclaimed + self.claimed + self.stale
    }
}
