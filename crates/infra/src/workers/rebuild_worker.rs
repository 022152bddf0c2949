//! Snapshot rebuild worker: claim → build → persist-or-record-error → delete/release.

use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use sheetcache_core::{normalize_error_for_log, SnapshotKey, WorkerId};
use sheetcache_observability::Diagnostics;

use crate::builder::{InstrumentLinkSource, SnapshotBuilder, SourceError};
use crate::queue::{QueueEntry, QueueError, RebuildQueue};
use crate::snapshots::{encode_payload, SnapshotMeta, SnapshotStore, SnapshotStoreError};

/// Total attempts (claims) before a failing key is given up.
pub const MAX_ATTEMPTS: u32 = 3;

/// Serialized payloads above this size are rejected like a build failure.
pub const MAX_PAYLOAD_BYTES: usize = 1_500_000;

/// Retry budget and payload cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildPolicy {
    pub max_attempts: u32,
    pub max_payload_bytes: usize,
}

impl Default for RebuildPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            max_payload_bytes: MAX_PAYLOAD_BYTES,
        }
    }
}

impl RebuildPolicy {
    /// Whether a row claimed `attempts` times has exhausted its budget.
    pub fn should_give_up(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Failure while rebuilding one key.
#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("failed to serialize snapshot payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Snapshot payload too large: {bytes} bytes")]
    PayloadTooLarge { bytes: usize },

    #[error(transparent)]
    Persist(#[from] SnapshotStoreError),
}

/// How a claimed row was disposed of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    /// Snapshot written, queue entry deleted.
    Persisted { instrument_count: usize, build_ms: u64 },
    /// Failure recorded, claim released for a later drain.
    Released { error: String },
    /// Failure recorded, retry budget exhausted, queue entry deleted.
    GaveUp { error: String },
}

impl RowOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RowOutcome::Persisted { .. })
    }
}

/// Result of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub claimed: usize,
    pub processed: usize,
    pub persisted: usize,
    pub released: usize,
    pub gave_up: usize,
}

/// Drains the rebuild queue under one worker identity.
///
/// Rows of a batch are processed strictly sequentially, and every failure is
/// contained to its row.
pub struct RebuildWorker<Q, S, L> {
    queue: Q,
    snapshots: S,
    builder: SnapshotBuilder<L>,
    worker_id: WorkerId,
    policy: RebuildPolicy,
    diagnostics: Diagnostics,
}

impl<Q, S, L> RebuildWorker<Q, S, L>
where
    Q: RebuildQueue,
    S: SnapshotStore,
    L: InstrumentLinkSource,
{
    pub fn new(queue: Q, snapshots: S, builder: SnapshotBuilder<L>, worker_id: WorkerId) -> Self {
        Self {
            queue,
            snapshots,
            builder,
            worker_id,
            policy: RebuildPolicy::default(),
            diagnostics: Diagnostics::disabled(),
        }
    }

    pub fn with_policy(mut self, policy: RebuildPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn snapshots(&self) -> &S {
        &self.snapshots
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn policy(&self) -> RebuildPolicy {
        self.policy
    }

    /// Claim up to `max_items` rows once and process them in claim order.
    ///
    /// Only a failed claim is returned as an error; per-row failures are
    /// recorded on the snapshot and counted in the report.
    pub async fn drain_queue(&self, max_items: usize) -> Result<DrainReport, QueueError> {
        self.diagnostics.drain_started(&self.worker_id, max_items);

        let rows = self.queue.claim_many(&self.worker_id, max_items).await?;
        let mut report = DrainReport {
            claimed: rows.len(),
            ..Default::default()
        };

        for row in &rows {
            self.diagnostics
                .row_claimed(&self.worker_id, row.key, row.attempts);

            match self.process_claimed_row(row).await {
                RowOutcome::Persisted { .. } => report.persisted += 1,
                RowOutcome::Released { .. } => report.released += 1,
                RowOutcome::GaveUp { .. } => report.gave_up += 1,
            }
            report.processed += 1;
        }

        self.diagnostics
            .drain_finished(&self.worker_id, report.claimed, report.processed);
        if report.claimed > 0 {
            info!(
                worker_id = %self.worker_id,
                claimed = report.claimed,
                persisted = report.persisted,
                released = report.released,
                gave_up = report.gave_up,
                "snapshot drain complete"
            );
        }

        Ok(report)
    }

    /// Build and persist one claimed row, then delete or release it.
    pub async fn process_claimed_row(&self, row: &QueueEntry) -> RowOutcome {
        let key = row.key;

        match self.build_and_persist(key).await {
            Ok((instrument_count, build_ms)) => {
                self.delete_entry(key).await;
                self.diagnostics.row_processed(
                    &self.worker_id,
                    key,
                    true,
                    Some(build_ms),
                    Some(instrument_count),
                );
                debug!(key = %key, instrument_count, build_ms, "snapshot rebuilt");
                RowOutcome::Persisted {
                    instrument_count,
                    build_ms,
                }
            }
            Err(err) => {
                let error = normalize_error_for_log(&err.to_string());

                if let Err(store_err) = self.snapshots.upsert_error(key, &error).await {
                    warn!(key = %key, error = %store_err, "failed to record snapshot error");
                }

                let outcome = if self.policy.should_give_up(row.attempts) {
                    warn!(
                        key = %key,
                        attempts = row.attempts,
                        error = %error,
                        "giving up on snapshot rebuild"
                    );
                    self.delete_entry(key).await;
                    RowOutcome::GaveUp { error }
                } else {
                    debug!(key = %key, attempts = row.attempts, error = %error, "snapshot rebuild failed, releasing");
                    match self.queue.release(key, &self.worker_id).await {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(key = %key, "claim no longer held, release skipped");
                        }
                        Err(queue_err) => {
                            warn!(key = %key, error = %queue_err, "failed to release snapshot claim");
                        }
                    }
                    RowOutcome::Released { error }
                };

                self.diagnostics
                    .row_processed(&self.worker_id, key, false, None, None);
                outcome
            }
        }
    }

    async fn build_and_persist(&self, key: SnapshotKey) -> Result<(usize, u64), RebuildError> {
        let started = Instant::now();
        let links = self.builder.build(key).await?;
        let build_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let payload = encode_payload(&links)?;
        if payload.len() > self.policy.max_payload_bytes {
            return Err(RebuildError::PayloadTooLarge {
                bytes: payload.len(),
            });
        }

        let meta = SnapshotMeta {
            build_ms,
            instrument_count: u32::try_from(links.len()).unwrap_or(u32::MAX),
        };
        self.snapshots.upsert_snapshot(key, &payload, meta).await?;

        Ok((links.len(), build_ms))
    }

    async fn delete_entry(&self, key: SnapshotKey) {
        if let Err(err) = self.queue.delete(key).await {
            warn!(key = %key, error = %err, "failed to delete snapshot queue entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sheetcache_core::InstrumentLink;

    use super::*;
    use crate::builder::InMemoryLinkSource;
    use crate::queue::InMemoryRebuildQueue;
    use crate::snapshots::InMemorySnapshotStore;

    type TestWorker =
        RebuildWorker<Arc<InMemoryRebuildQueue>, Arc<InMemorySnapshotStore>, Arc<InMemoryLinkSource>>;

    struct Harness {
        queue: Arc<InMemoryRebuildQueue>,
        snapshots: Arc<InMemorySnapshotStore>,
        source: Arc<InMemoryLinkSource>,
        worker: TestWorker,
    }

    fn harness() -> Harness {
        let queue = InMemoryRebuildQueue::arc();
        let snapshots = InMemorySnapshotStore::arc();
        let source = InMemoryLinkSource::arc();
        let worker = RebuildWorker::new(
            queue.clone(),
            snapshots.clone(),
            SnapshotBuilder::new(source.clone()),
            WorkerId::new("worker-a"),
        );
        Harness {
            queue,
            snapshots,
            source,
            worker,
        }
    }

    /// Claim `key` so that the returned row carries `attempts` claims.
    async fn claim_with_attempts(h: &Harness, key: SnapshotKey, attempts: u32) -> QueueEntry {
        h.queue.enqueue(key, "test").await.unwrap();
        let worker_id = h.worker.worker_id().clone();
        for _ in 1..attempts {
            h.queue.claim_one(&worker_id).await.unwrap().unwrap();
            assert!(h.queue.release(key, &worker_id).await.unwrap());
        }
        let row = h.queue.claim_one(&worker_id).await.unwrap().unwrap();
        assert_eq!(row.attempts, attempts);
        row
    }

    #[tokio::test]
    async fn success_persists_and_deletes() {
        let h = harness();
        let key = SnapshotKey::new(1, 5);
        h.source
            .set_links(key, vec![InstrumentLink::new(10, "PT-101")]);

        h.snapshots.upsert_error(key, "old failure").await.unwrap();
        let row = claim_with_attempts(&h, key, 1).await;

        let outcome = h.worker.process_claimed_row(&row).await;
        assert!(matches!(outcome, RowOutcome::Persisted { instrument_count: 1, .. }));

        assert!(h.queue.get(key).await.unwrap().is_none());
        let snapshot = h.snapshots.get(key).await.unwrap().unwrap();
        assert_eq!(snapshot.instrument_count, 1);
        assert_eq!(snapshot.last_error, None);
        assert_eq!(snapshot.links(), Some(vec![InstrumentLink::new(10, "PT-101")]));
    }

    #[tokio::test]
    async fn failure_below_budget_releases() {
        let h = harness();
        let key = SnapshotKey::new(1, 5);
        h.source.set_failure(key, "deadlock\n\ndetected   on relation");

        let row = claim_with_attempts(&h, key, 2).await;
        let outcome = h.worker.process_claimed_row(&row).await;

        let expected = "link source query failed: deadlock detected on relation";
        assert_eq!(outcome, RowOutcome::Released { error: expected.to_string() });

        let entry = h.queue.get(key).await.unwrap().unwrap();
        assert!(entry.claimed_at.is_none());
        assert!(entry.claimed_by.is_none());
        assert_eq!(entry.attempts, 2);

        let snapshot = h.snapshots.get(key).await.unwrap().unwrap();
        assert_eq!(snapshot.last_error.as_deref(), Some(expected));
    }

    #[tokio::test]
    async fn failure_on_last_attempt_gives_up() {
        let h = harness();
        let key = SnapshotKey::new(1, 5);
        h.source.set_failure(key, "boom");

        let row = claim_with_attempts(&h, key, MAX_ATTEMPTS).await;
        let outcome = h.worker.process_claimed_row(&row).await;

        assert!(matches!(outcome, RowOutcome::GaveUp { .. }));
        assert!(h.queue.get(key).await.unwrap().is_none());
        let snapshot = h.snapshots.get(key).await.unwrap().unwrap();
        assert_eq!(snapshot.last_error.as_deref(), Some("link source query failed: boom"));
    }

    #[tokio::test]
    async fn failure_keeps_previous_good_payload() {
        let h = harness();
        let key = SnapshotKey::new(4, 2);
        h.source.set_links(key, vec![InstrumentLink::new(1, "FT-1")]);

        let row = claim_with_attempts(&h, key, 1).await;
        assert!(h.worker.process_claimed_row(&row).await.is_success());

        h.source.set_failure(key, "source offline");
        let row = claim_with_attempts(&h, key, 1).await;
        assert!(!h.worker.process_claimed_row(&row).await.is_success());

        let snapshot = h.snapshots.get(key).await.unwrap().unwrap();
        assert_eq!(snapshot.links(), Some(vec![InstrumentLink::new(1, "FT-1")]));
        assert!(snapshot.has_error());
    }

    #[tokio::test]
    async fn oversized_payload_is_recorded_as_failure() {
        let h = harness();
        let key = SnapshotKey::new(1, 5);
        h.source.set_links(
            key,
            vec![InstrumentLink::new(1, "X".repeat(MAX_PAYLOAD_BYTES))],
        );

        let row = claim_with_attempts(&h, key, 1).await;
        let outcome = h.worker.process_claimed_row(&row).await;

        let RowOutcome::Released { error } = outcome else {
            panic!("expected release, got {outcome:?}");
        };
        let bytes: usize = error
            .strip_prefix("Snapshot payload too large: ")
            .and_then(|rest| rest.strip_suffix(" bytes"))
            .and_then(|n| n.parse().ok())
            .expect("message format");
        assert!(bytes > MAX_PAYLOAD_BYTES);

        // Never persisted: the error-only row has no payload.
        let snapshot = h.snapshots.get(key).await.unwrap().unwrap();
        assert_eq!(snapshot.payload, None);
        assert_eq!(snapshot.last_error.as_deref(), Some(error.as_str()));
        assert!(h.queue.get(key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn oversized_payload_on_last_attempt_gives_up() {
        let h = harness();
        let key = SnapshotKey::new(1, 6);
        let worker = RebuildWorker::new(
            h.queue.clone(),
            h.snapshots.clone(),
            SnapshotBuilder::new(h.source.clone()),
            h.worker.worker_id().clone(),
        )
        .with_policy(RebuildPolicy {
            max_payload_bytes: 16,
            ..Default::default()
        });
        h.source.set_links(key, vec![InstrumentLink::new(1, "PT-0000000001")]);

        let row = claim_with_attempts(&h, key, 3).await;
        let outcome = worker.process_claimed_row(&row).await;

        assert!(matches!(outcome, RowOutcome::GaveUp { ref error } if error.starts_with("Snapshot payload too large: ")));
        assert!(h.queue.get(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn release_after_reclaim_by_other_worker_is_noop() {
        let h = harness();
        let key = SnapshotKey::new(7, 7);
        h.source.set_failure(key, "slow and failing");

        let row = claim_with_attempts(&h, key, 1).await;
        // Simulate a fresh enqueue followed by another worker's claim.
        h.queue.enqueue(key, "newer edit").await.unwrap();
        let other = WorkerId::new("worker-b");
        h.queue.claim_one(&other).await.unwrap().unwrap();

        let outcome = h.worker.process_claimed_row(&row).await;
        assert!(matches!(outcome, RowOutcome::Released { .. }));

        let entry = h.queue.get(key).await.unwrap().unwrap();
        assert_eq!(entry.claimed_by.as_ref(), Some(&other));
    }

    #[tokio::test]
    async fn drain_processes_batch_in_order_and_isolates_failures() {
        let h = harness();
        let ok = SnapshotKey::new(1, 5);
        let bad = SnapshotKey::new(1, 7);
        h.source.set_links(ok, vec![InstrumentLink::new(10, "PT-101")]);
        h.source.set_failure(bad, "broken");

        h.queue.enqueue(bad, "first").await.unwrap();
        h.queue.enqueue(ok, "second").await.unwrap();

        let report = h.worker.drain_queue(5).await.unwrap();
        assert_eq!(
            report,
            DrainReport {
                claimed: 2,
                processed: 2,
                persisted: 1,
                released: 1,
                gave_up: 0,
            }
        );
        assert!(h.queue.get(ok).await.unwrap().is_none());
        assert!(h.queue.get(bad).await.unwrap().is_some());
        assert!(h.snapshots.get(bad).await.unwrap().unwrap().has_error());
    }

    #[tokio::test]
    async fn drain_respects_batch_size() {
        let h = harness();
        for sheet in 0..5 {
            h.queue.enqueue(SnapshotKey::new(1, sheet), "bulk").await.unwrap();
        }

        let report = h.worker.drain_queue(2).await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(h.queue.len(), 3);

        let report = h.worker.drain_queue(0).await.unwrap();
        assert_eq!(report, DrainReport::default());
    }

    #[tokio::test]
    async fn persistently_failing_key_is_given_up_after_three_drains() {
        let h = harness();
        let key = SnapshotKey::new(2, 2);
        h.source.set_failure(key, "bad data");
        h.queue.enqueue(key, "edit").await.unwrap();

        let reports = [
            h.worker.drain_queue(5).await.unwrap(),
            h.worker.drain_queue(5).await.unwrap(),
            h.worker.drain_queue(5).await.unwrap(),
        ];
        assert_eq!(reports[0].released, 1);
        assert_eq!(reports[1].released, 1);
        assert_eq!(reports[2].gave_up, 1);

        assert!(h.queue.is_empty());
        assert_eq!(h.worker.drain_queue(5).await.unwrap().claimed, 0);
    }
}
