//! Background rebuild processing.
//!
//! - [`RebuildWorker`]: claims queue rows and rebuilds their snapshots.
//! - [`RebuildScheduler`]: debounced drain trigger plus a periodic poller.

pub mod rebuild_worker;
pub mod scheduler;

pub use rebuild_worker::{
    DrainReport, RebuildError, RebuildPolicy, RebuildWorker, RowOutcome, MAX_ATTEMPTS,
    MAX_PAYLOAD_BYTES,
};
pub use scheduler::{PollerHandle, RebuildScheduler, SchedulerStats, DEFAULT_BATCH_SIZE};
