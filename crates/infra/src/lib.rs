//! Infrastructure layer: rebuild queue, snapshot store, link source, workers.
//!
//! Every store has a Postgres adapter and an in-memory twin used by tests and
//! local development.

pub mod builder;
pub mod clock;
pub mod config;
pub mod db;
pub mod queue;
pub mod snapshots;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use builder::{InMemoryLinkSource, InstrumentLinkSource, PostgresLinkSource, SnapshotBuilder};
pub use config::{ConfigError, RebuildConfig};
pub use queue::{InMemoryRebuildQueue, PostgresRebuildQueue, RebuildQueue};
pub use snapshots::{InMemorySnapshotStore, PostgresSnapshotStore, SnapshotStore};
pub use workers::{PollerHandle, RebuildScheduler, RebuildWorker};
