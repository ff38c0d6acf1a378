//! Engine status and per-pass results.

use std::time::Duration;

/// Live state of the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncStatus {
    /// No pass running. Initial state, and the state after a stop.
    Idle,
    InProgress { progress: u8, message: String },
    Paused { reason: String },
    Completed { records_synced: usize, duration: Duration },
    Failed { error: String, retry_count: u32 },
}

impl SyncStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, SyncStatus::InProgress { .. } | SyncStatus::Paused { .. })
    }
}

/// Progress percentage for `processed` of `total` records.
pub(crate) fn progress_percent(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    (processed.min(total) * 100 / total) as u8
}

/// Result of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Records applied remotely and removed from the queue.
    pub synced: usize,
    /// Records that became FAILED during this pass.
    pub failed: usize,
    /// Records returned to PENDING after a retryable failure.
    pub retried: usize,
    /// Records that hit a conflict.
    pub conflicts: usize,
    /// Records left untouched because an earlier same-entity record is unfinished.
    pub deferred: usize,
    pub duration: Duration,
    /// The pass stopped before processing its whole snapshot.
    pub cancelled: bool,
}
