//! Durable task store backed by SQLite.
//!
//! The store is the sole source of truth for task state and the only
//! contended resource in the system. Every concurrency-critical transition
//! is a single conditional `UPDATE` guarded on the current status, so two
//! concurrent callers can never both observe success for the same
//! transition: the loser's update matches zero rows.
//!
//! The schema is part of the public contract. Out-of-process maintenance
//! tools may open the same database file and delete rows (never update
//! status fields) without coordination; every operation here tolerates rows
//! that vanish between statements.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use metrics::counter;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::QueueError;
use crate::models::{CancelOutcome, ParseResult, QueueStats, Task, TaskStatus};

/// What to do on startup with tasks left `processing` by a prior run.
///
/// When the dispatcher starts there are no live workers, so every
/// `processing` row is an orphan from an unclean shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPolicy {
    /// Return orphans to `pending` so they are dispatched again. Re-parsing
    /// a document is safe (merely wasteful), so this is the default.
    /// Orphans that already had cancellation requested are cancelled
    /// instead of requeued.
    #[default]
    Requeue,
    /// Mark orphans `failed` with a recovery error message, surfacing the
    /// interruption to clients instead of retrying.
    Fail,
}

impl FromStr for RecoveryPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requeue" => Ok(Self::Requeue),
            "fail" => Ok(Self::Fail),
            _ => Err(()),
        }
    }
}

/// A terminal state write: status plus the payload that goes with it.
///
/// Exactly one of `result` / `error_message` ends up populated, depending
/// on the variant.
#[derive(Debug, Clone)]
pub enum TerminalOutcome {
    /// Parse succeeded; stores the result payload.
    Completed(ParseResult),
    /// Parse failed; stores the error message.
    Failed(String),
    /// Cooperative cancellation took effect.
    Cancelled,
}

impl TerminalOutcome {
    /// The status this outcome writes.
    #[must_use]
    pub const fn status(&self) -> TaskStatus {
        match self {
            Self::Completed(_) => TaskStatus::Completed,
            Self::Failed(_) => TaskStatus::Failed,
            Self::Cancelled => TaskStatus::Cancelled,
        }
    }
}

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    file_name TEXT NOT NULL,
    source_ref TEXT NOT NULL,
    lang TEXT NOT NULL,
    backend_variant TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    owner TEXT,
    error_message TEXT,
    result TEXT,
    cancel_requested INTEGER NOT NULL DEFAULT 0
)";

const DISPATCH_INDEX: &str = "\
CREATE INDEX IF NOT EXISTS idx_tasks_dispatch
ON tasks (status, priority DESC, created_at ASC)";

/// Durable, transactional mapping from `task_id` to [`Task`].
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    /// Opens (creating if missing) the task database at `path` and ensures
    /// the schema exists.
    ///
    /// WAL journal mode keeps readers (including out-of-process maintenance
    /// tools) unblocked while the queue writes.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::StoreUnavailable` if the database cannot be
    /// opened or the schema cannot be created.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), QueueError> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        sqlx::query(DISPATCH_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    /// Returns the underlying pool, e.g. for maintenance queries in tests.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Inserts a newly admitted task.
    ///
    /// # Errors
    ///
    /// * `QueueError::DuplicateId` - a task with this id already exists
    /// * `QueueError::StoreUnavailable` - the store is down
    pub async fn insert(&self, task: &Task) -> Result<(), QueueError> {
        let result_json = encode_result(task.result.as_ref())?;
        let outcome = sqlx::query(
            "INSERT INTO tasks (task_id, file_name, source_ref, lang, backend_variant, \
             priority, status, created_at, started_at, completed_at, owner, error_message, \
             result, cancel_requested) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )
        .bind(task.task_id.to_string())
        .bind(&task.file_name)
        .bind(&task.source_ref)
        .bind(&task.lang)
        .bind(&task.backend_variant)
        .bind(task.priority)
        .bind(task.status.as_str())
        .bind(encode_ts(task.created_at))
        .bind(task.started_at.map(encode_ts))
        .bind(task.completed_at.map(encode_ts))
        .bind(&task.owner)
        .bind(&task.error_message)
        .bind(result_json)
        .bind(i64::from(task.cancel_requested))
        .execute(&self.pool)
        .await;

        match outcome {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(QueueError::DuplicateId {
                    task_id: task.task_id,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetches a task by id.
    ///
    /// # Errors
    ///
    /// * `QueueError::NotFound` - no row with this id (unknown or deleted
    ///   by an external tool)
    /// * `QueueError::StoreUnavailable` - the store is down
    pub async fn get(&self, task_id: Uuid) -> Result<Task, QueueError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?1")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_task(&row),
            None => Err(QueueError::NotFound { task_id }),
        }
    }

    /// Atomically transitions a task from `pending` to `processing`,
    /// setting `owner` and `started_at`.
    ///
    /// This is the single concurrency-critical primitive: one conditional
    /// update guarded on `status = 'pending'`. Returns `true` iff this
    /// caller won; a lost race or a vanished row both return `false` and
    /// are not errors.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::StoreUnavailable` if the store is down.
    pub async fn try_claim(&self, task_id: Uuid, owner: &str) -> Result<bool, QueueError> {
        let affected = sqlx::query(
            "UPDATE tasks SET status = 'processing', owner = ?1, started_at = ?2 \
             WHERE task_id = ?3 AND status = 'pending'",
        )
        .bind(owner)
        .bind(encode_ts(Utc::now()))
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 1 {
            counter!("docq.claims.success").increment(1);
            Ok(true)
        } else {
            counter!("docq.claims.lost").increment(1);
            Ok(false)
        }
    }

    /// Writes a terminal state for a task that is currently `processing`.
    ///
    /// Clears `owner`, sets `completed_at`, and populates exactly one of
    /// `result` / `error_message` per the outcome. Guarded on
    /// `status = 'processing'` to defend against duplicate completion.
    ///
    /// # Errors
    ///
    /// * `QueueError::Conflict` - the task is not currently `processing`
    /// * `QueueError::NotFound` - the row vanished
    /// * `QueueError::StoreUnavailable` - the store is down
    pub async fn set_terminal(
        &self,
        task_id: Uuid,
        outcome: TerminalOutcome,
    ) -> Result<(), QueueError> {
        let status = outcome.status();
        let (result_json, error_message) = match &outcome {
            TerminalOutcome::Completed(result) => (encode_result(Some(result))?, None),
            TerminalOutcome::Failed(message) => (None, Some(message.clone())),
            TerminalOutcome::Cancelled => (None, None),
        };

        let affected = sqlx::query(
            "UPDATE tasks SET status = ?1, completed_at = ?2, result = ?3, \
             error_message = ?4, owner = NULL \
             WHERE task_id = ?5 AND status = 'processing'",
        )
        .bind(status.as_str())
        .bind(encode_ts(Utc::now()))
        .bind(result_json)
        .bind(error_message)
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 1 {
            return Ok(());
        }

        // Distinguish a vanished row from a duplicate/invalid terminal write.
        let current = self.get(task_id).await?;
        Err(QueueError::Conflict {
            task_id,
            reason: format!(
                "terminal write to {status} rejected: task is {}",
                current.status
            ),
        })
    }

    /// Requests cancellation of a task.
    ///
    /// * `pending` - transitions directly to `cancelled`; accepted.
    /// * `processing` - sets `cancel_requested`; accepted with an advisory
    ///   that cancellation is cooperative and may not take effect
    ///   immediately.
    /// * terminal - rejected with a descriptive message (idempotent:
    ///   cancelling a cancelled task is also rejected).
    ///
    /// Never blocks waiting for in-flight work to stop.
    ///
    /// # Errors
    ///
    /// * `QueueError::NotFound` - no row with this id
    /// * `QueueError::StoreUnavailable` - the store is down
    pub async fn request_cancel(&self, task_id: Uuid) -> Result<CancelOutcome, QueueError> {
        loop {
            let affected = sqlx::query(
                "UPDATE tasks SET status = 'cancelled', completed_at = ?1 \
                 WHERE task_id = ?2 AND status = 'pending'",
            )
            .bind(encode_ts(Utc::now()))
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();

            if affected == 1 {
                counter!("docq.tasks.cancelled", "phase" => "pending").increment(1);
                return Ok(CancelOutcome::accepted("task cancelled before dispatch"));
            }

            let affected = sqlx::query(
                "UPDATE tasks SET cancel_requested = 1 \
                 WHERE task_id = ?1 AND status = 'processing'",
            )
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();

            if affected == 1 {
                return Ok(CancelOutcome::accepted(
                    "cancellation requested; the task is in flight and will stop at the \
                     worker's next checkpoint",
                ));
            }

            let current = self.get(task_id).await?;
            match current.status {
                TaskStatus::Cancelled => {
                    return Ok(CancelOutcome::rejected("task is already cancelled"));
                }
                status if status.is_terminal() => {
                    return Ok(CancelOutcome::rejected(format!(
                        "task is already {status} and cannot be cancelled"
                    )));
                }
                // The task changed status between the two guarded updates
                // (e.g. claimed right after the pending check). Retry.
                _ => {}
            }
        }
    }

    /// Returns the id of the best pending candidate: maximum `priority`,
    /// ties broken by earliest `created_at` (then insertion order).
    ///
    /// Re-issued on every dispatcher scan, so the sequence is restartable
    /// by construction and unaffected by rows deleted mid-scan.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::StoreUnavailable` if the store is down.
    pub async fn next_pending(&self) -> Result<Option<Uuid>, QueueError> {
        let row = sqlx::query(
            "SELECT task_id FROM tasks WHERE status = 'pending' \
             ORDER BY priority DESC, created_at ASC, rowid ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(decode_id(&row)?)),
            None => Ok(None),
        }
    }

    /// Returns up to `limit` pending tasks in dispatch order.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::StoreUnavailable` if the store is down.
    pub async fn list_pending(&self, limit: u32) -> Result<Vec<Task>, QueueError> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE status = 'pending' \
             ORDER BY priority DESC, created_at ASC, rowid ASC LIMIT ?1",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_task).collect()
    }

    /// Reads the persisted `cancel_requested` flag for an in-flight task.
    ///
    /// # Errors
    ///
    /// * `QueueError::NotFound` - the row vanished
    /// * `QueueError::StoreUnavailable` - the store is down
    pub async fn cancel_requested(&self, task_id: Uuid) -> Result<bool, QueueError> {
        let row = sqlx::query("SELECT cancel_requested FROM tasks WHERE task_id = ?1")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(row.try_get::<i64, _>("cancel_requested")? != 0),
            None => Err(QueueError::NotFound { task_id }),
        }
    }

    /// Aggregate counts for all five statuses plus total.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::StoreUnavailable` if the store is down.
    pub async fn counts_by_status(&self) -> Result<QueueStats, QueueError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            match status.parse::<TaskStatus>() {
                Ok(status) => stats.record(status, count.unsigned_abs()),
                Err(()) => {
                    tracing::warn!(status = %status, "Ignoring rows with unknown status");
                }
            }
        }
        Ok(stats)
    }

    /// Applies the recovery policy to tasks left `processing` by a prior
    /// run. Returns how many tasks were recovered.
    ///
    /// Must run before dispatch starts, while no workers are live.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::StoreUnavailable` if the store is down.
    pub async fn recover_orphans(&self, policy: RecoveryPolicy) -> Result<u64, QueueError> {
        match policy {
            RecoveryPolicy::Requeue => {
                let cancelled = sqlx::query(
                    "UPDATE tasks SET status = 'cancelled', owner = NULL, completed_at = ?1 \
                     WHERE status = 'processing' AND cancel_requested = 1",
                )
                .bind(encode_ts(Utc::now()))
                .execute(&self.pool)
                .await?
                .rows_affected();

                let requeued = sqlx::query(
                    "UPDATE tasks SET status = 'pending', owner = NULL, started_at = NULL \
                     WHERE status = 'processing'",
                )
                .execute(&self.pool)
                .await?
                .rows_affected();

                Ok(cancelled + requeued)
            }
            RecoveryPolicy::Fail => {
                let failed = sqlx::query(
                    "UPDATE tasks SET status = 'failed', owner = NULL, completed_at = ?1, \
                     error_message = ?2 WHERE status = 'processing'",
                )
                .bind(encode_ts(Utc::now()))
                .bind("interrupted by queue restart before completion")
                .execute(&self.pool)
                .await?
                .rows_affected();

                Ok(failed)
            }
        }
    }
}

/// Fixed-width RFC 3339 with microseconds, so lexicographic order in the
/// store matches chronological order.
fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(raw: &str) -> Result<DateTime<Utc>, QueueError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(format!("invalid timestamp {raw:?}: {e}").into()).into())
}

fn encode_result(result: Option<&ParseResult>) -> Result<Option<String>, QueueError> {
    result
        .map(|r| {
            serde_json::to_string(r)
                .map_err(|e| sqlx::Error::Encode(Box::new(e)).into())
        })
        .transpose()
}

fn decode_id(row: &SqliteRow) -> Result<Uuid, QueueError> {
    let raw: String = row.try_get("task_id")?;
    Uuid::parse_str(&raw)
        .map_err(|e| sqlx::Error::Decode(format!("invalid task_id {raw:?}: {e}").into()).into())
}

fn row_to_task(row: &SqliteRow) -> Result<Task, QueueError> {
    let status_raw: String = row.try_get("status")?;
    let status = status_raw
        .parse::<TaskStatus>()
        .map_err(|()| sqlx::Error::Decode(format!("unknown status {status_raw:?}").into()))?;

    let result_raw: Option<String> = row.try_get("result")?;
    let result = result_raw
        .map(|raw| serde_json::from_str::<ParseResult>(&raw))
        .transpose()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    let started_at: Option<String> = row.try_get("started_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;

    Ok(Task {
        task_id: decode_id(row)?,
        file_name: row.try_get("file_name")?,
        source_ref: row.try_get("source_ref")?,
        lang: row.try_get("lang")?,
        backend_variant: row.try_get("backend_variant")?,
        priority: row.try_get("priority")?,
        status,
        created_at: decode_ts(&row.try_get::<String, _>("created_at")?)?,
        started_at: started_at.as_deref().map(decode_ts).transpose()?,
        completed_at: completed_at.as_deref().map(decode_ts).transpose()?,
        owner: row.try_get("owner")?,
        error_message: row.try_get("error_message")?,
        result,
        cancel_requested: row.try_get::<i64, _>("cancel_requested")? != 0,
    })
}
