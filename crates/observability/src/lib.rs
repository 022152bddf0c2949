//! Tracing, logging and rebuild diagnostics (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Env-gated structured events for the snapshot rebuild pipeline.
pub mod diagnostics;

pub use diagnostics::{Diagnostics, DIAGNOSTICS_ENV};
