//! Dispatch loop with a bounded worker-slot pool and graceful shutdown.
//!
//! The dispatcher repeatedly selects the best pending candidate (maximum
//! priority, earliest admission first) and attempts an atomic claim. A lost
//! claim race or a row deleted out from under the scan is expected control
//! flow, not an error: the candidate is discarded and the scan restarts.
//! A worker-slot permit is held *before* claiming, so a successful claim is
//! handed to a worker immediately and never idles in `processing`.
//!
//! On startup, recovery runs before the first dispatch: tasks left
//! `processing` by a prior run are requeued or failed per the configured
//! [`RecoveryPolicy`].

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::signal;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::models::Task;
use crate::store::{TaskStore, TerminalOutcome};
use crate::worker::{execute_task, BackendRegistry};

/// Backoff applied when the store is unavailable, before retrying dispatch.
const STORE_OUTAGE_BACKOFF: Duration = Duration::from_secs(1);

/// How many times the post-claim read is retried across a store hiccup
/// before the claim is settled as failed instead of left dangling.
const CLAIM_READ_RETRIES: u32 = 3;
const CLAIM_READ_RETRY_DELAY: Duration = Duration::from_millis(25);

/// Creates a shutdown signal channel.
///
/// Send `true` through the sender to stop the dispatch loop; in-flight
/// tasks get the configured grace period to finish.
#[must_use]
pub fn shutdown_signal() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, then requests a stop through the
/// shutdown channel.
pub async fn wait_for_shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Cannot install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!(signal = "SIGINT", "Stop requested, draining the queue");
        }
        () = terminate => {
            tracing::info!(signal = "SIGTERM", "Stop requested, draining the queue");
        }
    }

    if shutdown_tx.send(true).is_err() {
        tracing::error!("No dispatcher is listening for shutdown");
    }
}

/// Selects, claims, and hands pending tasks to a bounded pool of worker
/// slots.
pub struct Dispatcher {
    store: TaskStore,
    backends: Arc<BackendRegistry>,
    config: QueueConfig,
    dispatcher_id: String,
}

impl Dispatcher {
    /// Creates a dispatcher over the given store and backend registry.
    #[must_use]
    pub fn new(store: TaskStore, backends: Arc<BackendRegistry>, config: QueueConfig) -> Self {
        let dispatcher_id = format!("dispatcher-{}", Uuid::new_v4());
        Self {
            store,
            backends,
            config,
            dispatcher_id,
        }
    }

    /// This dispatcher's unique identifier; prefixes worker-slot owner ids.
    #[must_use]
    pub fn dispatcher_id(&self) -> &str {
        &self.dispatcher_id
    }

    /// Runs recovery, then the dispatch loop, until `shutdown` flips to
    /// true. In-flight tasks are given the configured grace period before
    /// being abandoned to the next restart's recovery.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::StoreUnavailable` only if startup recovery
    /// cannot reach the store; a store outage after startup pauses
    /// dispatch with backoff instead.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        let recovered = self
            .store
            .recover_orphans(self.config.recovery_policy)
            .await?;
        if recovered > 0 {
            tracing::warn!(
                count = recovered,
                policy = ?self.config.recovery_policy,
                "Recovered tasks left processing by a prior run"
            );
        }

        tracing::info!(
            dispatcher_id = %self.dispatcher_id,
            workers = self.config.workers,
            "Dispatcher started"
        );

        let slots = Arc::new(Semaphore::new(self.config.workers));
        let mut inflight: JoinSet<()> = JoinSet::new();
        let mut slot_seq: u64 = 0;

        while !*shutdown.borrow() {
            // Hold a free slot before claiming, so the claim never waits.
            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => {
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Shutdown sender dropped; treat as a stop request.
                        break;
                    }
                    continue;
                }
            };

            // Reap finished workers so the join set does not grow unbounded.
            while inflight.try_join_next().is_some() {}

            let claimed = match self.claim_next(&mut slot_seq).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
                Err(QueueError::StoreUnavailable(e)) => {
                    drop(permit);
                    counter!("docq.dispatch.store_outages").increment(1);
                    tracing::warn!(error = %e, "Store unavailable, pausing dispatch");
                    tokio::select! {
                        () = tokio::time::sleep(STORE_OUTAGE_BACKOFF) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
                Err(e) => {
                    // Expected races are handled inside claim_next; anything
                    // else here is a single candidate gone sideways.
                    drop(permit);
                    tracing::debug!(error = %e, "Discarding dispatch candidate");
                    continue;
                }
            };

            let store = self.store.clone();
            let backends = Arc::clone(&self.backends);
            let cancel_poll = self.config.cancel_poll_interval;
            inflight.spawn(async move {
                // Permit is the worker slot; released on every exit path.
                let _permit = permit;
                execute_task(&store, backends.as_ref(), claimed, cancel_poll).await;
            });
        }

        tracing::info!(
            dispatcher_id = %self.dispatcher_id,
            inflight = inflight.len(),
            "Dispatcher stopping, draining in-flight tasks"
        );

        let drain = async {
            while inflight.join_next().await.is_some() {}
        };
        if timeout(self.config.shutdown_grace_period, drain).await.is_err() {
            tracing::warn!(
                "Shutdown grace period elapsed; abandoning in-flight tasks to next recovery"
            );
        }

        Ok(())
    }

    /// Scans for the best pending candidate and tries to claim it,
    /// re-scanning after every lost race until the queue is drained or a
    /// claim sticks.
    async fn claim_next(&self, slot_seq: &mut u64) -> Result<Option<Task>, QueueError> {
        loop {
            let Some(task_id) = self.store.next_pending().await? else {
                return Ok(None);
            };

            *slot_seq += 1;
            let owner = format!("{}/slot-{}", self.dispatcher_id, slot_seq);

            if !self.store.try_claim(task_id, &owner).await? {
                // Lost the race or the row vanished; both expected.
                tracing::debug!(task_id = %task_id, "Claim did not apply, re-scanning");
                continue;
            }

            match self.fetch_claimed(task_id).await? {
                Some(task) => {
                    tracing::debug!(task_id = %task_id, owner = %owner, "Task claimed");
                    return Ok(Some(task));
                }
                // Deleted externally between claim and read; nothing to run.
                None => {
                    tracing::debug!(task_id = %task_id, "Claimed row vanished, re-scanning");
                    continue;
                }
            }
        }
    }

    /// Reads back a task this dispatcher just claimed, riding out transient
    /// store hiccups. Returns `None` if the row was deleted externally.
    ///
    /// If the store stays unavailable past the retry budget, the claim is
    /// settled as failed (best effort) rather than left `processing` with no
    /// live worker for the rest of this process's lifetime.
    async fn fetch_claimed(&self, task_id: Uuid) -> Result<Option<Task>, QueueError> {
        let mut attempt = 0;
        loop {
            match self.store.get(task_id).await {
                Ok(task) => return Ok(Some(task)),
                Err(QueueError::NotFound { .. }) => return Ok(None),
                Err(QueueError::StoreUnavailable(e)) if attempt < CLAIM_READ_RETRIES => {
                    attempt += 1;
                    tracing::warn!(
                        task_id = %task_id,
                        error = %e,
                        attempt,
                        "Post-claim read failed, retrying"
                    );
                    tokio::time::sleep(CLAIM_READ_RETRY_DELAY).await;
                }
                Err(QueueError::StoreUnavailable(e)) => {
                    let settle = self
                        .store
                        .set_terminal(
                            task_id,
                            TerminalOutcome::Failed(
                                "task store unavailable while handing off to a worker"
                                    .to_string(),
                            ),
                        )
                        .await;
                    match settle {
                        Ok(()) => {
                            tracing::warn!(
                                task_id = %task_id,
                                "Claimed task failed after post-claim read outage"
                            );
                        }
                        Err(settle_err) => {
                            // Still down; restart recovery owns the row now.
                            tracing::error!(
                                task_id = %task_id,
                                error = %settle_err,
                                "Could not settle claimed task after store outage"
                            );
                        }
                    }
                    return Err(QueueError::StoreUnavailable(e));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("dispatcher_id", &self.dispatcher_id)
            .field("workers", &self.config.workers)
            .finish_non_exhaustive()
    }
}
