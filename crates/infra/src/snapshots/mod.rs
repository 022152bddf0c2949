//! Snapshot persistence (the cached read model).
//!
//! One row per sheet key holding the last successfully built payload plus the
//! most recent failure. Readers call `SnapshotStore::get` and then
//! `Snapshot::links` (or `parse_and_validate`); `None` is a cache miss.

pub mod codec;
pub mod postgres;
pub mod store;
pub mod types;

pub use codec::{encode_payload, parse_and_validate};
pub use postgres::PostgresSnapshotStore;
pub use store::{InMemorySnapshotStore, SnapshotStore, SnapshotStoreError};
pub use types::{Snapshot, SnapshotMeta, CURRENT_BUILD_VERSION, INITIAL_BUILD_VERSION};
