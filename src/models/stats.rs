use serde::Serialize;

use super::TaskStatus;

/// Aggregate task counts across all lifecycle statuses.
///
/// Every status is present even when zero, and the per-status counts always
/// sum to `total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Total number of tasks in the store.
    pub total: u64,
    /// Tasks waiting for dispatch.
    pub pending: u64,
    /// Tasks currently held by a worker slot.
    pub processing: u64,
    /// Tasks that completed successfully.
    pub completed: u64,
    /// Tasks that failed.
    pub failed: u64,
    /// Tasks that were cancelled.
    pub cancelled: u64,
}

impl QueueStats {
    /// Returns the count for one status.
    #[must_use]
    pub const fn count(&self, status: TaskStatus) -> u64 {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Processing => self.processing,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
            TaskStatus::Cancelled => self.cancelled,
        }
    }

    /// Adds `count` tasks with the given status, keeping `total` in sync.
    pub fn record(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::Processing => self.processing += count,
            TaskStatus::Completed => self.completed += count,
            TaskStatus::Failed => self.failed += count,
            TaskStatus::Cancelled => self.cancelled += count,
        }
        self.total += count;
    }
}
