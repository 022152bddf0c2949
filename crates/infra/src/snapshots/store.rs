//! Snapshot store abstraction and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sheetcache_core::{truncate_chars, SnapshotKey, MAX_ERROR_CHARS};

use super::types::{Snapshot, SnapshotMeta, CURRENT_BUILD_VERSION};
use crate::clock::{Clock, SystemClock};

/// Latest built (or failed) snapshot per key.
///
/// Each operation must be atomic at the storage layer. A failure never removes
/// a previously good payload.
#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, key: SnapshotKey) -> Result<Option<Snapshot>, SnapshotStoreError>;

    /// Replace payload and metadata, stamp the current build version and clear
    /// any recorded failure.
    async fn upsert_snapshot(
        &self,
        key: SnapshotKey,
        payload: &str,
        meta: SnapshotMeta,
    ) -> Result<(), SnapshotStoreError>;

    /// Record a failure (truncated to 500 characters) without touching the
    /// payload. Creates an empty row when none exists yet.
    async fn upsert_error(&self, key: SnapshotKey, message: &str) -> Result<(), SnapshotStoreError>;
}

/// Snapshot store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SnapshotStoreError {
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait::async_trait]
impl<S> SnapshotStore for Arc<S>
where
    S: SnapshotStore + ?Sized,
{
    async fn get(&self, key: SnapshotKey) -> Result<Option<Snapshot>, SnapshotStoreError> {
        (**self).get(key).await
    }

    async fn upsert_snapshot(
        &self,
        key: SnapshotKey,
        payload: &str,
        meta: SnapshotMeta,
    ) -> Result<(), SnapshotStoreError> {
        (**self).upsert_snapshot(key, payload, meta).await
    }

    async fn upsert_error(&self, key: SnapshotKey, message: &str) -> Result<(), SnapshotStoreError> {
        (**self).upsert_error(key, message).await
    }
}

/// In-memory snapshot store for tests/dev.
#[derive(Debug)]
pub struct InMemorySnapshotStore {
    rows: RwLock<HashMap<SnapshotKey, Snapshot>>,
    clock: Arc<dyn Clock>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> SnapshotStoreError {
    SnapshotStoreError::Storage("lock poisoned".to_string())
}

#[async_trait::async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn get(&self, key: SnapshotKey) -> Result<Option<Snapshot>, SnapshotStoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows.get(&key).cloned())
    }

    async fn upsert_snapshot(
        &self,
        key: SnapshotKey,
        payload: &str,
        meta: SnapshotMeta,
    ) -> Result<(), SnapshotStoreError> {
        let now = self.clock.now();
        let mut rows = self.rows.write().map_err(|_| poisoned())?;

        rows.insert(
            key,
            Snapshot {
                key,
                payload: Some(payload.to_string()),
                built_at: Some(now),
                build_ms: Some(meta.build_ms),
                instrument_count: meta.instrument_count,
                build_version: CURRENT_BUILD_VERSION,
                last_error: None,
                last_error_at: None,
            },
        );
        Ok(())
    }

    async fn upsert_error(&self, key: SnapshotKey, message: &str) -> Result<(), SnapshotStoreError> {
        let now = self.clock.now();
        let message = truncate_chars(message, MAX_ERROR_CHARS).to_string();
        let mut rows = self.rows.write().map_err(|_| poisoned())?;

        match rows.get_mut(&key) {
            Some(row) => {
                row.last_error = Some(message);
                row.last_error_at = Some(now);
            }
            None => {
                rows.insert(key, Snapshot::errored(key, message, now));
            }
        }
        Ok(())
    }
}
