//! Debounced drain scheduling and the periodic poller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use sheetcache_core::SnapshotKey;

use super::rebuild_worker::{DrainReport, RebuildWorker};
use crate::builder::InstrumentLinkSource;
use crate::queue::{QueueError, RebuildQueue};
use crate::snapshots::SnapshotStore;

/// Default number of rows claimed per scheduled drain.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Cumulative scheduler statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SchedulerStats {
    pub drains: u64,
    pub rows_processed: u64,
    pub persisted: u64,
    pub released: u64,
    pub gave_up: u64,
    pub claim_failures: u64,
}

impl SchedulerStats {
    fn record(&mut self, report: &DrainReport) {
        self.drains += 1;
        self.rows_processed += report.processed as u64;
        self.persisted += report.persisted as u64;
        self.released += report.released as u64;
        self.gave_up += report.gave_up as u64;
    }
}

/// Owns the "drain pending or running" flag for one worker.
///
/// At most one drain is in flight per scheduler. Clones share the flag.
pub struct RebuildScheduler<Q, S, L> {
    worker: Arc<RebuildWorker<Q, S, L>>,
    batch_size: usize,
    scheduled: Arc<AtomicBool>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl<Q, S, L> Clone for RebuildScheduler<Q, S, L> {
    fn clone(&self) -> Self {
        Self {
            worker: self.worker.clone(),
            batch_size: self.batch_size,
            scheduled: self.scheduled.clone(),
            stats: self.stats.clone(),
        }
    }
}

/// Clears the scheduled flag when the drain task ends, including by panic.
struct ScheduledGuard(Arc<AtomicBool>);

impl Drop for ScheduledGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<Q, S, L> RebuildScheduler<Q, S, L>
where
    Q: RebuildQueue + 'static,
    S: SnapshotStore + 'static,
    L: InstrumentLinkSource + 'static,
{
    pub fn new(worker: RebuildWorker<Q, S, L>) -> Self {
        Self {
            worker: Arc::new(worker),
            batch_size: DEFAULT_BATCH_SIZE,
            scheduled: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(SchedulerStats::default())),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn worker(&self) -> &RebuildWorker<Q, S, L> {
        &self.worker
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Whether a drain is pending or running.
    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Schedule one background drain unless one is already pending or running.
    ///
    /// Returns the spawned task's handle, or `None` when debounced or when
    /// called outside a Tokio runtime.
    pub fn kick(&self) -> Option<JoinHandle<()>> {
        let Ok(runtime) = Handle::try_current() else {
            warn!("snapshot rebuild kick outside a tokio runtime, ignored");
            return None;
        };

        if self
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("snapshot drain already scheduled");
            return None;
        }

        let guard = ScheduledGuard(self.scheduled.clone());
        let worker = self.worker.clone();
        let stats = self.stats.clone();
        let batch_size = self.batch_size;

        Some(runtime.spawn(async move {
            let _guard = guard;
            let result = worker.drain_queue(batch_size).await;
            record_drain(&stats, &result);
            if let Err(err) = result {
                error!(worker_id = %worker.worker_id(), error = %err, "snapshot drain failed to claim");
            }
        }))
    }

    /// Enqueue `key` and kick a drain.
    pub async fn request_rebuild(&self, key: SnapshotKey, reason: &str) -> Result<(), QueueError> {
        self.worker.queue().enqueue(key, reason).await?;
        self.kick();
        Ok(())
    }

    /// Kick on a fixed interval until the returned handle is shut down.
    ///
    /// Outside a Tokio runtime nothing is spawned and the returned handle is
    /// inert (`is_running()` is false).
    pub fn spawn_poller(&self, interval: Duration) -> PollerHandle {
        let Ok(runtime) = Handle::try_current() else {
            warn!("snapshot rebuild poller requested outside a tokio runtime, ignored");
            return PollerHandle {
                shutdown: None,
                join: None,
            };
        };

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let scheduler = self.clone();

        let join = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                worker_id = %scheduler.worker.worker_id(),
                interval_ms = interval.as_millis() as u64,
                "snapshot rebuild poller started"
            );

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        scheduler.kick();
                    }
                }
            }

            info!(worker_id = %scheduler.worker.worker_id(), "snapshot rebuild poller stopped");
        });

        PollerHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
        }
    }

    /// Wait until no drain is pending or running.
    pub async fn wait_idle(&self) {
        while self.is_scheduled() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn record_drain(stats: &Mutex<SchedulerStats>, result: &Result<DrainReport, QueueError>) {
    let Ok(mut stats) = stats.lock() else {
        return;
    };
    match result {
        Ok(report) => stats.record(report),
        Err(_) => stats.claim_failures += 1,
    }
}

/// Handle to a running poller.
#[derive(Debug)]
pub struct PollerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Whether the poller task is still ticking.
    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }

    /// Stop ticking and wait for the poller task to exit. An in-flight drain
    /// keeps running; use [`RebuildScheduler::wait_idle`] to wait for it.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}
