//! `sheetcache-core`: domain building blocks for the instrument-link snapshot cache.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the `InstrumentLink` value object and text normalization used
//! for diagnostics.

pub mod error;
pub mod id;
pub mod instrument;
pub mod text;
pub mod value_object;

pub use error::{DomainError, DomainResult};
pub use id::{AccountId, SheetId, SnapshotKey, WorkerId};
pub use instrument::InstrumentLink;
pub use text::{normalize_error_for_log, truncate_chars, MAX_ERROR_CHARS};
pub use value_object::ValueObject;
