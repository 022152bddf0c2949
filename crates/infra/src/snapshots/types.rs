//! Snapshot row and build metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sheetcache_core::{InstrumentLink, SnapshotKey};

use super::codec::parse_and_validate;

/// Schema version of the payload format written by this build.
pub const CURRENT_BUILD_VERSION: i32 = 1;

/// Version tag given to rows created by `upsert_error` before any success.
pub const INITIAL_BUILD_VERSION: i32 = 1;

/// Cached instrument-link view for one sheet. At most one row per key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub key: SnapshotKey,
    /// Serialized JSON array of `InstrumentLink`; `None` until a build succeeds.
    pub payload: Option<String>,
    pub built_at: Option<DateTime<Utc>>,
    pub build_ms: Option<u64>,
    pub instrument_count: u32,
    pub build_version: i32,
    /// Most recent failure; kept independently of the payload.
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    /// Row recording a failure before any successful build.
    pub fn errored(key: SnapshotKey, message: String, at: DateTime<Utc>) -> Self {
        Self {
            key,
            payload: None,
            built_at: None,
            build_ms: None,
            instrument_count: 0,
            build_version: INITIAL_BUILD_VERSION,
            last_error: Some(message),
            last_error_at: Some(at),
        }
    }

    /// Decoded payload, or `None` on a cache miss (never built, stale schema
    /// version, or malformed payload).
    pub fn links(&self) -> Option<Vec<InstrumentLink>> {
        let payload = self.payload.as_deref()?;
        parse_and_validate(payload, self.build_version)
    }

    pub fn has_error(&self) -> bool {
        self.last_error.is_some()
    }
}

/// Metadata recorded with a successful build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub build_ms: u64,
    pub instrument_count: u32,
}
