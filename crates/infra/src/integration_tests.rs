//! End-to-end tests for the rebuild pipeline over the in-memory backends.
//!
//! Tests: enqueue → claim → build → persist → delete/release → read.
//!
//! Verifies:
//! - A drained key ends up as a readable snapshot with no queue entry left
//! - Batches are processed in enqueue order with failures isolated per row
//! - Re-enqueueing merges instead of duplicating
//! - Stale claims are reclaimed and the stale worker cannot release them

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::Duration;

    use sheetcache_core::{InstrumentLink, SnapshotKey, WorkerId};

    use crate::builder::{InMemoryLinkSource, InstrumentLinkSource, SnapshotBuilder, SourceError};
    use crate::clock::ManualClock;
    use crate::queue::{InMemoryRebuildQueue, RebuildQueue};
    use crate::snapshots::{encode_payload, parse_and_validate, InMemorySnapshotStore, SnapshotStore};
    use crate::workers::{RebuildScheduler, RebuildWorker};

    /// Wraps a source and records the order keys were built in.
    #[derive(Debug, Default)]
    struct RecordingSource {
        inner: InMemoryLinkSource,
        seen: Mutex<Vec<SnapshotKey>>,
    }

    impl RecordingSource {
        fn seen(&self) -> Vec<SnapshotKey> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl InstrumentLinkSource for RecordingSource {
        async fn fetch_links(&self, key: SnapshotKey) -> Result<Vec<InstrumentLink>, SourceError> {
            self.seen.lock().unwrap().push(key);
            self.inner.fetch_links(key).await
        }
    }

    struct Pipeline {
        clock: Arc<ManualClock>,
        queue: Arc<InMemoryRebuildQueue>,
        snapshots: Arc<InMemorySnapshotStore>,
        source: Arc<RecordingSource>,
    }

    impl Pipeline {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::default());
            Self {
                queue: Arc::new(InMemoryRebuildQueue::with_clock(clock.clone())),
                snapshots: Arc::new(InMemorySnapshotStore::with_clock(clock.clone())),
                source: Arc::new(RecordingSource::default()),
                clock,
            }
        }

        fn worker(
            &self,
            id: &str,
        ) -> RebuildWorker<Arc<InMemoryRebuildQueue>, Arc<InMemorySnapshotStore>, Arc<RecordingSource>>
        {
            RebuildWorker::new(
                self.queue.clone(),
                self.snapshots.clone(),
                SnapshotBuilder::new(self.source.clone()),
                WorkerId::new(id),
            )
        }
    }

    #[tokio::test]
    async fn enqueued_key_is_rebuilt_and_dequeued() {
        let p = Pipeline::new();
        let key = SnapshotKey::new(1, 5);
        let link = InstrumentLink::new(10, "PT-101")
            .with_tag_norm("PT101")
            .with_type("pressure transmitter");
        p.source.inner.set_links(key, vec![link.clone()]);

        p.queue.enqueue(key, "link-added").await.unwrap();
        let report = p.worker("w1").drain_queue(5).await.unwrap();
        assert_eq!(report.processed, 1);

        let snapshot = p.snapshots.get(key).await.unwrap().unwrap();
        assert_eq!(snapshot.instrument_count, 1);
        assert_eq!(
            snapshot.payload.as_deref(),
            Some(encode_payload(&[link.clone()]).unwrap().as_str())
        );
        assert_eq!(snapshot.last_error, None);
        assert_eq!(
            parse_and_validate(snapshot.payload.as_deref().unwrap(), snapshot.build_version),
            Some(vec![link])
        );
        assert!(p.queue.get(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_is_processed_in_enqueue_order_with_isolated_failures() {
        let p = Pipeline::new();
        let first = SnapshotKey::new(1, 5);
        let second = SnapshotKey::new(1, 7);
        p.source.inner.set_failure(first, "source timeout");
        p.source
            .inner
            .set_links(second, vec![InstrumentLink::new(3, "FT-300")]);

        p.queue.enqueue(first, "link-added").await.unwrap();
        p.clock.advance(Duration::milliseconds(5));
        p.queue.enqueue(second, "link-removed").await.unwrap();

        let report = p.worker("w1").drain_queue(5).await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(p.source.seen(), vec![first, second]);

        // The failing key keeps its entry for the next drain.
        let failed = p.snapshots.get(first).await.unwrap().unwrap();
        assert_eq!(failed.last_error.as_deref(), Some("link source query failed: source timeout"));
        assert_eq!(failed.links(), None);
        let entry = p.queue.get(first).await.unwrap().unwrap();
        assert!(entry.claimed_by.is_none());

        let rebuilt = p.snapshots.get(second).await.unwrap().unwrap();
        assert_eq!(rebuilt.instrument_count, 1);
        assert!(p.queue.get(second).await.unwrap().is_none());

        // Once the source recovers the retried key succeeds too.
        p.source.inner.clear_failure(first);
        p.worker("w1").drain_queue(5).await.unwrap();
        assert!(!p.snapshots.get(first).await.unwrap().unwrap().has_error());
        assert!(p.queue.is_empty());
    }

    #[tokio::test]
    async fn repeated_enqueue_merges_into_one_rebuild() {
        let p = Pipeline::new();
        let key = SnapshotKey::new(2, 9);

        for reason in ["link-added", "link-updated", "bulk-import"] {
            p.queue.enqueue(key, reason).await.unwrap();
            p.clock.advance(Duration::seconds(1));
        }

        let entry = p.queue.get(key).await.unwrap().unwrap();
        assert_eq!(entry.reason.as_deref(), Some("bulk-import"));
        assert_eq!(p.queue.len(), 1);

        let report = p.worker("w1").drain_queue(10).await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(p.source.seen(), vec![key]);
    }

    #[tokio::test]
    async fn stale_claim_is_taken_over_by_another_worker() {
        let p = Pipeline::new();
        let key = SnapshotKey::new(4, 4);
        p.source
            .inner
            .set_links(key, vec![InstrumentLink::new(1, "LT-1")]);
        p.queue.enqueue(key, "edit").await.unwrap();

        let stuck = WorkerId::new("stuck");
        p.queue.claim_many(&stuck, 5).await.unwrap();

        p.clock.advance(Duration::minutes(4));
        assert_eq!(p.worker("w2").drain_queue(5).await.unwrap().claimed, 0);

        p.clock.advance(Duration::minutes(2));
        let report = p.worker("w2").drain_queue(5).await.unwrap();
        assert_eq!(report.persisted, 1);

        assert!(!p.queue.release(key, &stuck).await.unwrap());
        assert!(p.snapshots.get(key).await.unwrap().unwrap().links().is_some());
    }

    #[tokio::test]
    async fn request_rebuild_through_scheduler() {
        let p = Pipeline::new();
        let key = SnapshotKey::new(8, 1);
        p.source
            .inner
            .set_links(key, vec![InstrumentLink::new(5, "TT-5").with_loop_tags(["L-9"])]);

        let scheduler = RebuildScheduler::new(p.worker("sched")).with_batch_size(5);
        scheduler.request_rebuild(key, "link-added").await.unwrap();
        scheduler.wait_idle().await;

        let links = p.snapshots.get(key).await.unwrap().unwrap().links().unwrap();
        assert_eq!(links[0].loop_tags, vec!["L-9".to_string()]);
        assert_eq!(scheduler.stats().persisted, 1);
    }
}
