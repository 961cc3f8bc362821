//! Task execution against pluggable parsing backends.
//!
//! A worker runs exactly one claimed task: it looks up the backend
//! registered for the task's `backend_variant`, invokes it, and writes a
//! terminal status. No backend failure ever escapes the task's execution
//! scope, so one failing task can never take a worker slot down with it.
//!
//! Cancellation is cooperative. The worker checks the persisted
//! `cancel_requested` flag before invoking the backend, mirrors it into a
//! [`CancellationToken`] while the backend runs (backends should poll the
//! token between major parsing stages), and classifies the outcome after
//! the backend returns.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::models::{ParseResult, Task};
use crate::store::{TaskStore, TerminalOutcome};

/// A parsing failure reported by a backend.
///
/// Recorded into the task's `error_message`; never raised to the
/// dispatcher.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct BackendError(String);

impl BackendError {
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// Convenience for a failure caused by an observed cancellation.
    #[must_use]
    pub fn cancelled() -> Self {
        Self("parsing aborted by cancellation request".to_string())
    }
}

/// The slice of a task a backend needs to do its work.
#[derive(Debug, Clone, Copy)]
pub struct ParseRequest<'a> {
    /// Display name of the submitted file.
    pub file_name: &'a str,
    /// Opaque locator for the input.
    pub source_ref: &'a str,
    /// Parsing language hint.
    pub lang: &'a str,
}

impl<'a> ParseRequest<'a> {
    /// Borrows a request from a task record.
    #[must_use]
    pub fn from_task(task: &'a Task) -> Self {
        Self {
            file_name: &task.file_name,
            source_ref: &task.source_ref,
            lang: &task.lang,
        }
    }
}

/// A pluggable document-parsing backend.
///
/// Backends receive a cancellation token and should check
/// `cancel.is_cancelled()` between major parsing stages, returning early
/// with an error when it fires. If a backend completes successfully despite
/// a late cancellation, the finished result is kept; a backend error with
/// the token fired is classified as a cancellation, not a failure.
#[async_trait]
pub trait ParserBackend: Send + Sync {
    /// The `backend_variant` this backend serves.
    fn variant(&self) -> &str;

    /// Parses one document. May block its worker slot for minutes.
    async fn parse(
        &self,
        request: ParseRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<ParseResult, BackendError>;
}

/// Registry mapping `backend_variant` to a [`ParserBackend`].
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Box<dyn ParserBackend>>,
}

impl BackendRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backend under its variant name, replacing any previous
    /// backend for that variant.
    pub fn register(&mut self, backend: Box<dyn ParserBackend>) {
        self.backends.insert(backend.variant().to_string(), backend);
    }

    /// Looks up the backend for a variant.
    #[must_use]
    pub fn get(&self, variant: &str) -> Option<&dyn ParserBackend> {
        self.backends.get(variant).map(AsRef::as_ref)
    }

    /// Returns true if a backend is registered for the variant.
    #[must_use]
    pub fn has_backend(&self, variant: &str) -> bool {
        self.backends.contains_key(variant)
    }

    /// Registered variant names.
    #[must_use]
    pub fn variants(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("variants", &self.variants())
            .finish()
    }
}

/// Executes one claimed task end to end and writes its terminal status.
///
/// Every exit path ends in a terminal write attempt; conflicts and vanished
/// rows on that write are logged and swallowed (the row was mutated or
/// deleted out from under us, and the store already holds the truth).
///
/// `cancel_poll` controls how often the persisted `cancel_requested` flag
/// is mirrored into the backend's cancellation token.
pub async fn execute_task(
    store: &TaskStore,
    backends: &BackendRegistry,
    task: Task,
    cancel_poll: Duration,
) {
    let task_id = task.task_id;
    let outcome = run_backend(store, backends, &task, cancel_poll).await;
    let status = outcome.status();

    match store.set_terminal(task_id, outcome).await {
        Ok(()) => {
            counter!("docq.tasks.finished", "status" => status.as_str()).increment(1);
            tracing::info!(task_id = %task_id, status = %status, "Task finished");
        }
        Err(QueueError::NotFound { .. }) => {
            tracing::warn!(task_id = %task_id, "Task row vanished before terminal write");
        }
        Err(QueueError::Conflict { reason, .. }) => {
            tracing::warn!(task_id = %task_id, reason = %reason, "Terminal write rejected");
        }
        Err(e) => {
            // Store outage: the task stays processing and is picked up by
            // recovery on the next restart.
            tracing::error!(task_id = %task_id, error = %e, "Failed to write terminal status");
        }
    }
}

async fn run_backend(
    store: &TaskStore,
    backends: &BackendRegistry,
    task: &Task,
    cancel_poll: Duration,
) -> TerminalOutcome {
    // Checkpoint: a cancellation that landed between claim and execution.
    match store.cancel_requested(task.task_id).await {
        Ok(true) => return TerminalOutcome::Cancelled,
        Ok(false) => {}
        Err(e) => {
            // Flag unreadable (row vanished or store hiccup). Proceed; the
            // terminal write will sort out the truth.
            tracing::debug!(task_id = %task.task_id, error = %e, "Cancel flag check failed");
        }
    }

    let Some(backend) = backends.get(&task.backend_variant) else {
        counter!("docq.tasks.failed", "reason" => "no_backend").increment(1);
        return TerminalOutcome::Failed(format!(
            "no parser backend registered for variant: {}",
            task.backend_variant
        ));
    };

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(mirror_cancel_flag(
        store.clone(),
        task.task_id,
        cancel.clone(),
        cancel_poll,
    ));

    let start = Instant::now();
    let parsed = backend.parse(ParseRequest::from_task(task), &cancel).await;
    watcher.abort();

    histogram!("docq.task.duration_seconds", "backend" => task.backend_variant.clone())
        .record(start.elapsed().as_secs_f64());

    match parsed {
        Ok(result) => TerminalOutcome::Completed(result),
        // Checkpoint: a backend error with the token fired is a
        // cancellation taking effect, not a parse failure.
        Err(_) if cancel.is_cancelled() => TerminalOutcome::Cancelled,
        Err(e) => {
            counter!("docq.tasks.failed", "reason" => "backend").increment(1);
            tracing::debug!(task_id = %task.task_id, error = %e, "Backend reported failure");
            TerminalOutcome::Failed(e.to_string())
        }
    }
}

/// Mirrors the persisted `cancel_requested` flag into a token the backend
/// can poll between stages. A vanished row also fires the token: the work
/// has no row to report into anymore.
async fn mirror_cancel_flag(
    store: TaskStore,
    task_id: uuid::Uuid,
    cancel: CancellationToken,
    poll: Duration,
) {
    loop {
        tokio::time::sleep(poll).await;
        match store.cancel_requested(task_id).await {
            Ok(true) | Err(QueueError::NotFound { .. }) => {
                cancel.cancel();
                return;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::debug!(task_id = %task_id, error = %e, "Cancel flag poll failed");
            }
        }
    }
}
