use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Represents the lifecycle status of a task in the queue.
///
/// Tasks progress through states: `Pending` -> `Processing` ->
/// `Completed`/`Failed`. A `Pending` task can be cancelled directly; a
/// `Processing` task can only be cancelled cooperatively, at the worker's
/// next checkpoint. All three of `Completed`, `Failed`, and `Cancelled` are
/// terminal: no further writes except external row deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is waiting to be claimed by the dispatcher.
    Pending,
    /// Task has been claimed and a worker slot owns it.
    Processing,
    /// Task completed successfully; `result` is populated.
    Completed,
    /// Task failed; `error_message` is populated.
    Failed,
    /// Task was cancelled before or during execution.
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    /// All status variants, for exhaustive aggregation.
    pub const ALL: &'static [Self] = &[
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Lowercase string as persisted in the store. Part of the public
    /// schema contract for out-of-process maintenance tools.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true if no further transitions are allowed from this status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for TaskStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured output of a successful parse.
///
/// Present only on `Completed` tasks. Stored as a JSON column so the shape
/// can grow without schema migrations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseResult {
    /// Name of the rendered markdown file, if the backend produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown_file: Option<String>,
    /// Extracted document content.
    pub content: String,
    /// Whether the document contained embedded images.
    #[serde(default)]
    pub has_images: bool,
}

/// A task in the queue.
///
/// Created by admission with status `Pending`, mutated only by the
/// dispatcher (claim), workers (terminal writes), and cancellation.
/// `task_id` is immutable and never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, assigned at admission.
    pub task_id: Uuid,

    /// Display name of the submitted file.
    pub file_name: String,

    /// Opaque locator for the input, passed through to the backend.
    pub source_ref: String,

    /// Parsing language hint, opaque passthrough.
    pub lang: String,

    /// Which parsing backend to use, opaque passthrough.
    pub backend_variant: String,

    /// Scheduling priority. Higher is more urgent; may be negative.
    pub priority: i64,

    /// Current lifecycle status.
    #[serde(default)]
    pub status: TaskStatus,

    /// When the task was admitted. Tiebreaker for FIFO-within-priority.
    pub created_at: DateTime<Utc>,

    /// When the task was claimed. Exposed so a supervising layer can detect
    /// stuck tasks; the queue itself imposes no deadline.
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,

    /// Identifier of the worker slot holding this task.
    /// Non-empty iff status is `Processing`.
    pub owner: Option<String>,

    /// Failure description. Set iff status is `Failed`.
    pub error_message: Option<String>,

    /// Parse output. Set iff status is `Completed`.
    pub result: Option<ParseResult>,

    /// Whether cancellation has been requested while `Processing`.
    /// Observed cooperatively by the worker at checkpoints.
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Task {
    /// Creates a new `Pending` task from a validated submission, assigning
    /// a fresh id and admission timestamp.
    #[must_use]
    pub fn admit(new: NewTask) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            file_name: new.file_name,
            source_ref: new.source_ref,
            lang: new.lang,
            backend_variant: new.backend_variant,
            priority: new.priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            owner: None,
            error_message: None,
            result: None,
            cancel_requested: false,
        }
    }

    /// Maps the task to its client-facing shape.
    #[must_use]
    pub fn view(&self) -> TaskView {
        TaskView {
            task_id: self.task_id,
            file_name: self.file_name.clone(),
            status: self.status,
            priority: self.priority,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            data: self.result.clone(),
            error_message: self.error_message.clone(),
        }
    }
}

/// A task submission, before admission assigns an id.
///
/// `priority` defaults to 0; `lang` and `backend_variant` have passthrough
/// defaults matching the most common parsing configuration.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Display name of the submitted file.
    pub file_name: String,
    /// Opaque locator for the input.
    pub source_ref: String,
    /// Parsing language hint.
    pub lang: String,
    /// Which parsing backend to use.
    pub backend_variant: String,
    /// Scheduling priority.
    pub priority: i64,
}

impl NewTask {
    /// Creates a submission with default `lang`, `backend_variant`, and
    /// priority 0.
    #[must_use]
    pub fn new(file_name: impl Into<String>, source_ref: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            source_ref: source_ref.into(),
            lang: "auto".to_string(),
            backend_variant: "pipeline".to_string(),
            priority: 0,
        }
    }

    /// Sets the parsing language hint.
    #[must_use]
    pub fn lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    /// Sets the parsing backend variant.
    #[must_use]
    pub fn backend_variant(mut self, variant: impl Into<String>) -> Self {
        self.backend_variant = variant.into();
        self
    }

    /// Sets the scheduling priority. Higher is more urgent; negative values
    /// park the task behind all default-priority work.
    #[must_use]
    pub const fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// Client-facing task shape returned by status lookups.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    /// The task's id.
    pub task_id: Uuid,
    /// Display name of the submitted file.
    pub file_name: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Scheduling priority.
    pub priority: i64,
    /// Admission time.
    pub created_at: DateTime<Utc>,
    /// Claim time, if claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time, if terminal.
    pub completed_at: Option<DateTime<Utc>>,
    /// Parse output, present only when `Completed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ParseResult>,
    /// Failure description, present only when `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Outcome of a cancellation request.
///
/// Cancellation never blocks waiting for in-flight work to stop; it only
/// requests. For `Processing` tasks the request is cooperative and may not
/// take effect immediately.
#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    /// Whether the request was accepted.
    pub success: bool,
    /// Human-readable explanation.
    pub message: String,
}

impl CancelOutcome {
    /// An accepted cancellation.
    #[must_use]
    pub fn accepted(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    /// A rejected cancellation (task already terminal or otherwise
    /// uncancellable).
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}
