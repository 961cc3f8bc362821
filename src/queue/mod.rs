//! Client-facing queue operations.
//!
//! [`Queue`] is the admission and inspection surface: it validates and
//! persists new tasks, reports status and aggregate counts, and forwards
//! cancellation requests. Dispatch and execution live in
//! [`crate::dispatcher`]; both sides share the same [`TaskStore`].

use metrics::counter;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::models::{CancelOutcome, NewTask, QueueStats, Task, TaskView};
use crate::store::TaskStore;

/// Handle for submitting, inspecting, and cancelling tasks.
///
/// Cheap to clone; every clone shares the underlying connection pool.
#[derive(Debug, Clone)]
pub struct Queue {
    store: TaskStore,
}

impl Queue {
    /// Opens the queue over the store at the configured database path,
    /// creating the schema if needed.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::StoreUnavailable` if the database cannot be
    /// opened or migrated.
    pub async fn open(config: &QueueConfig) -> Result<Self, QueueError> {
        let store = TaskStore::open(&config.db_path).await?;
        Ok(Self { store })
    }

    /// Wraps an already-open store.
    #[must_use]
    pub fn with_store(store: TaskStore) -> Self {
        Self { store }
    }

    /// The underlying store, for wiring up a [`crate::dispatcher::Dispatcher`].
    #[must_use]
    pub fn store(&self) -> TaskStore {
        self.store.clone()
    }

    /// Admits a new task and returns its id immediately.
    ///
    /// The task is durably `pending` when this returns; parsing happens
    /// later, on a dispatcher worker slot.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Validation` if `file_name` or `source_ref` is
    /// empty or whitespace, and `QueueError::StoreUnavailable` if the
    /// write fails.
    pub async fn submit(&self, new: NewTask) -> Result<Uuid, QueueError> {
        if new.file_name.trim().is_empty() {
            return Err(QueueError::Validation(
                "file_name must not be empty".to_string(),
            ));
        }
        if new.source_ref.trim().is_empty() {
            return Err(QueueError::Validation(
                "source_ref must not be empty".to_string(),
            ));
        }
        if new.backend_variant.trim().is_empty() {
            return Err(QueueError::Validation(
                "backend_variant must not be empty".to_string(),
            ));
        }

        let task = Task::admit(new);
        let task_id = task.task_id;
        self.store.insert(&task).await?;

        counter!("docq.tasks.submitted").increment(1);
        tracing::info!(
            task_id = %task_id,
            file_name = %task.file_name,
            backend_variant = %task.backend_variant,
            priority = task.priority,
            "Task submitted"
        );
        Ok(task_id)
    }

    /// Returns the current view of a task: status, result payload when
    /// completed, error message when failed.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::NotFound` if the task does not exist, which
    /// also covers rows removed directly from the store by external
    /// cleanup.
    pub async fn status(&self, task_id: Uuid) -> Result<TaskView, QueueError> {
        let task = self.store.get(task_id).await?;
        Ok(task.view())
    }

    /// Requests cancellation of a task.
    ///
    /// A `pending` task is cancelled immediately and never runs. A
    /// `processing` task is flagged; its worker observes the flag at the
    /// next checkpoint and stops cooperatively. Tasks already in a
    /// terminal status are reported as not cancellable, with the message
    /// explaining why.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::NotFound` if the task does not exist.
    pub async fn cancel(&self, task_id: Uuid) -> Result<CancelOutcome, QueueError> {
        let outcome = self.store.request_cancel(task_id).await?;
        if outcome.success {
            counter!("docq.tasks.cancel_requested").increment(1);
            tracing::info!(task_id = %task_id, message = %outcome.message, "Cancellation requested");
        } else {
            tracing::debug!(task_id = %task_id, message = %outcome.message, "Cancellation rejected");
        }
        Ok(outcome)
    }

    /// Returns aggregate task counts, one entry per status plus the total.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::StoreUnavailable` if the store cannot be read.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.store.counts_by_status().await
    }

    /// Lists up to `limit` pending tasks in dispatch order.
    ///
    /// The snapshot is re-read from the store on every call, so rows
    /// deleted externally between calls simply stop appearing.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::StoreUnavailable` if the store cannot be read.
    pub async fn list_pending(&self, limit: u32) -> Result<Vec<TaskView>, QueueError> {
        let tasks = self.store.list_pending(limit).await?;
        Ok(tasks.iter().map(Task::view).collect())
    }
}
