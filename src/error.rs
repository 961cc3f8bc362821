//! Error taxonomy for queue operations.
//!
//! Every error that can cross the crate boundary is one of these variants,
//! so a transport layer can map them to distinct response shapes without
//! inspecting internals. Claim races and vanished rows are expected control
//! flow inside the dispatcher and are handled there, not surfaced.

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during task queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Malformed submission, rejected before a row is created.
    #[error("invalid submission: {0}")]
    Validation(String),

    /// No task with this id exists (never created, or deleted by an
    /// external maintenance tool).
    #[error("task not found: {task_id}")]
    NotFound {
        /// The id that could not be resolved.
        task_id: Uuid,
    },

    /// A task with this id already exists in the store.
    ///
    /// Should not occur with generated ids; defends the store's uniqueness
    /// invariant regardless.
    #[error("task id already exists: {task_id}")]
    DuplicateId {
        /// The colliding id.
        task_id: Uuid,
    },

    /// The task is not in the status required for this operation, e.g. a
    /// terminal write attempted on a task that is not `processing`.
    #[error("conflict on task {task_id}: {reason}")]
    Conflict {
        /// The task the operation targeted.
        task_id: Uuid,
        /// Why the operation was rejected.
        reason: String,
    },

    /// A parsing backend failed. Recorded into the task's `error_message`,
    /// never raised out of the worker's execution scope.
    #[error("backend failure: {0}")]
    Backend(String),

    /// The transactional store is unavailable. Fatal for the current
    /// operation; the dispatcher backs off and retries, callers should
    /// surface a 5xx-equivalent.
    #[error("task store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),
}

impl QueueError {
    /// Returns true if this error is expected control flow inside the
    /// dispatcher (claim race lost, row vanished) rather than a fault.
    #[must_use]
    pub const fn is_dispatch_race(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Conflict { .. })
    }
}
