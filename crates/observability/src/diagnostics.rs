//! Structured rebuild diagnostics.
//!
//! Purely observational: every method is a no-op unless the toggle is on, and
//! nothing in the pipeline depends on these events being emitted.

use sheetcache_core::{SnapshotKey, WorkerId};

/// Environment toggle enabling rebuild diagnostics (`1`, `true`, `yes`, `on`).
pub const DIAGNOSTICS_ENV: &str = "SNAPSHOT_REBUILD_DEBUG";

const TARGET: &str = "sheetcache::rebuild";

/// Emitter for row/drain lifecycle events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    enabled: bool,
}

impl Diagnostics {
    pub const fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub const fn disabled() -> Self {
        Self { enabled: false }
    }

    /// Read the toggle from [`DIAGNOSTICS_ENV`].
    pub fn from_env() -> Self {
        let enabled = std::env::var(DIAGNOSTICS_ENV)
            .map(|v| is_truthy(&v))
            .unwrap_or(false);
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn drain_started(&self, worker_id: &WorkerId, max_items: usize) {
        if self.enabled {
            tracing::info!(target: TARGET, worker_id = %worker_id, max_items, "snapshot drain started");
        }
    }

    pub fn drain_finished(&self, worker_id: &WorkerId, claimed: usize, processed: usize) {
        if self.enabled {
            tracing::info!(target: TARGET, worker_id = %worker_id, claimed, processed, "snapshot drain finished");
        }
    }

    pub fn row_claimed(&self, worker_id: &WorkerId, key: SnapshotKey, attempts: u32) {
        if self.enabled {
            tracing::info!(
                target: TARGET,
                worker_id = %worker_id,
                account_id = %key.account_id,
                sheet_id = %key.sheet_id,
                attempts,
                "snapshot row claimed"
            );
        }
    }

    pub fn row_processed(
        &self,
        worker_id: &WorkerId,
        key: SnapshotKey,
        success: bool,
        build_ms: Option<u64>,
        instrument_count: Option<usize>,
    ) {
        if self.enabled {
            tracing::info!(
                target: TARGET,
                worker_id = %worker_id,
                account_id = %key.account_id,
                sheet_id = %key.sheet_id,
                success,
                build_ms,
                instrument_count,
                "snapshot row processed"
            );
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
