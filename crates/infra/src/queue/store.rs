//! Rebuild queue abstraction and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sheetcache_core::{SnapshotKey, WorkerId};

use super::types::{normalize_reason, QueueEntry, QueueStats};
use crate::clock::{Clock, SystemClock};

/// Durable set of pending snapshot rebuilds with claim bookkeeping.
///
/// Implementations must make `claim_many` a single atomic operation: no two
/// concurrent callers may claim the same key, and an entry validly claimed by
/// another worker (within the claim TTL) is never returned.
#[async_trait::async_trait]
pub trait RebuildQueue: Send + Sync {
    /// Insert an unclaimed entry, or refresh the existing one (enqueue time,
    /// reason, claim cleared). Never creates a duplicate.
    async fn enqueue(&self, key: SnapshotKey, reason: &str) -> Result<(), QueueError>;

    /// Claim up to `max_items` claimable entries, oldest `enqueued_at` first.
    ///
    /// Returned entries reflect the claim (incremented `attempts`, `claimed_by`
    /// set to `worker_id`) and are in FIFO order.
    async fn claim_many(
        &self,
        worker_id: &WorkerId,
        max_items: usize,
    ) -> Result<Vec<QueueEntry>, QueueError>;

    /// Claim the single oldest claimable entry.
    async fn claim_one(&self, worker_id: &WorkerId) -> Result<Option<QueueEntry>, QueueError> {
        Ok(self.claim_many(worker_id, 1).await?.into_iter().next())
    }

    /// Clear the claim if it is still held by `worker_id`.
    ///
    /// Returns `false` when the entry is gone or claimed by someone else.
    async fn release(&self, key: SnapshotKey, worker_id: &WorkerId) -> Result<bool, QueueError>;

    /// Remove the entry unconditionally. Returns whether an entry existed.
    async fn delete(&self, key: SnapshotKey) -> Result<bool, QueueError>;

    /// Read a single entry.
    async fn get(&self, key: SnapshotKey) -> Result<Option<QueueEntry>, QueueError>;

    /// Count unclaimed, validly claimed and stale-claimed entries.
    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

/// Rebuild queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// A uniqueness constraint fired (concurrent first insert of a key).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait::async_trait]
impl<Q> RebuildQueue for Arc<Q>
where
    Q: RebuildQueue + ?Sized,
{
    async fn enqueue(&self, key: SnapshotKey, reason: &str) -> Result<(), QueueError> {
        (**self).enqueue(key, reason).await
    }

    async fn claim_many(
        &self,
        worker_id: &WorkerId,
        max_items: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        (**self).claim_many(worker_id, max_items).await
    }

    async fn claim_one(&self, worker_id: &WorkerId) -> Result<Option<QueueEntry>, QueueError> {
        (**self).claim_one(worker_id).await
    }

    async fn release(&self, key: SnapshotKey, worker_id: &WorkerId) -> Result<bool, QueueError> {
        (**self).release(key, worker_id).await
    }

    async fn delete(&self, key: SnapshotKey) -> Result<bool, QueueError> {
        (**self).delete(key).await
    }

    async fn get(&self, key: SnapshotKey) -> Result<Option<QueueEntry>, QueueError> {
        (**self).get(key).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        (**self).stats().await
    }
}

/// In-memory rebuild queue for tests/dev.
///
/// A single write lock covers each operation, which makes claims atomic within
/// the process.
#[derive(Debug)]
pub struct InMemoryRebuildQueue {
    entries: RwLock<HashMap<SnapshotKey, QueueEntry>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryRebuildQueue {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryRebuildQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> QueueError {
    QueueError::Storage("lock poisoned".to_string())
}

#[async_trait::async_trait]
impl RebuildQueue for InMemoryRebuildQueue {
    async fn enqueue(&self, key: SnapshotKey, reason: &str) -> Result<(), QueueError> {
        let reason = normalize_reason(reason);
        let now = self.clock.now();
        let mut entries = self.entries.write().map_err(|_| poisoned())?;

        match entries.get_mut(&key) {
            Some(entry) => entry.refresh(reason, now),
            None => {
                entries.insert(key, QueueEntry::new(key, reason, now));
            }
        }
        Ok(())
    }

    async fn claim_many(
        &self,
        worker_id: &WorkerId,
        max_items: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        if max_items == 0 {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let mut entries = self.entries.write().map_err(|_| poisoned())?;

        let mut candidates: Vec<(chrono::DateTime<chrono::Utc>, SnapshotKey)> = entries
            .values()
            .filter(|e| e.is_claimable(now))
            .map(|e| (e.enqueued_at, e.key))
            .collect();

        // FIFO, key as tie-breaker for equal timestamps
        candidates.sort();
        candidates.truncate(max_items);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, key) in candidates {
            if let Some(entry) = entries.get_mut(&key) {
                entry.mark_claimed(worker_id, now);
                claimed.push(entry.clone());
            }
        }

        Ok(claimed)
    }

    async fn release(&self, key: SnapshotKey, worker_id: &WorkerId) -> Result<bool, QueueError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        match entries.get_mut(&key) {
            Some(entry) if entry.is_claimed_by(worker_id) => {
                entry.clear_claim();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: SnapshotKey) -> Result<bool, QueueError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        Ok(entries.remove(&key).is_some())
    }

    async fn get(&self, key: SnapshotKey) -> Result<Option<QueueEntry>, QueueError> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(&key).cloned())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let now = self.clock.now();
        let entries = self.entries.read().map_err(|_| poisoned())?;

        let mut stats = QueueStats::default();
        for entry in entries.values() {
            match entry.claimed_at {
                None => stats.unclaimed += 1,
                Some(_) if entry.is_claimable(now) => stats.stale += 1,
                Some(_) => stats.claimed += 1,
            }
        }
        Ok(stats)
    }
}
