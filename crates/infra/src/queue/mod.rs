//! Durable rebuild queue with atomic multi-worker claiming.
//!
//! ## Design
//!
//! - The queue is a *set* of pending snapshot keys, not a log: enqueuing a
//!   pending key refreshes it
//! - Claims are time-bounded (5 minutes); a stale claim can be taken over by
//!   any worker
//! - Release is guarded by the claim holder's identity
//! - Terminal state is absence of a row (success or give-up)
//!
//! ## Components
//!
//! - `RebuildQueue`: queue abstraction
//! - `InMemoryRebuildQueue`: tests/dev
//! - `PostgresRebuildQueue`: durable backend

pub mod postgres;
pub mod store;
pub mod types;

pub use postgres::PostgresRebuildQueue;
pub use store::{InMemoryRebuildQueue, QueueError, RebuildQueue};
pub use types::{claim_ttl, QueueEntry, QueueStats, CLAIM_TTL_SECS, REASON_MAX_CHARS};
