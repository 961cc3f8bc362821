//! Queue configuration with environment-variable resolution.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::store::RecoveryPolicy;

/// Configuration for the queue and its dispatcher.
///
/// Resolution priority: explicit field assignment, then environment
/// variables via [`QueueConfig::from_env`], then the defaults below.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Path of the SQLite database file.
    pub db_path: PathBuf,
    /// Number of concurrent worker slots (`W`).
    pub workers: usize,
    /// How long the dispatcher sleeps when no pending task is found.
    pub poll_interval: Duration,
    /// How often an in-flight worker re-checks the persisted
    /// `cancel_requested` flag.
    pub cancel_poll_interval: Duration,
    /// Grace period for in-flight tasks on shutdown.
    pub shutdown_grace_period: Duration,
    /// What to do with tasks left `processing` by a prior run.
    pub recovery_policy: RecoveryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("docq.db"),
            workers: 4,
            poll_interval: Duration::from_millis(200),
            cancel_poll_interval: Duration::from_millis(500),
            shutdown_grace_period: Duration::from_secs(30),
            recovery_policy: RecoveryPolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Builds a configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable:
    ///
    /// - `DOCQ_DB_PATH` - database file path
    /// - `DOCQ_WORKERS` - worker slot count
    /// - `DOCQ_POLL_INTERVAL_MS` - dispatcher idle poll interval
    /// - `DOCQ_CANCEL_POLL_INTERVAL_MS` - cancel flag re-check interval
    /// - `DOCQ_SHUTDOWN_GRACE_SECS` - shutdown grace period
    /// - `DOCQ_RECOVERY_POLICY` - `requeue` or `fail`
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = env::var("DOCQ_DB_PATH") {
            if !path.is_empty() {
                config.db_path = PathBuf::from(path);
            }
        }
        if let Some(workers) = env_parse::<usize>("DOCQ_WORKERS") {
            if workers > 0 {
                config.workers = workers;
            }
        }
        if let Some(ms) = env_parse::<u64>("DOCQ_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("DOCQ_CANCEL_POLL_INTERVAL_MS") {
            config.cancel_poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("DOCQ_SHUTDOWN_GRACE_SECS") {
            config.shutdown_grace_period = Duration::from_secs(secs);
        }
        if let Ok(policy) = env::var("DOCQ_RECOVERY_POLICY") {
            match policy.parse() {
                Ok(policy) => config.recovery_policy = policy,
                Err(()) => {
                    tracing::warn!(
                        value = %policy,
                        "Unrecognized DOCQ_RECOVERY_POLICY, using default"
                    );
                }
            }
        }

        config
    }

    /// Sets the database path.
    #[must_use]
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    /// Sets the worker slot count.
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the recovery policy for orphaned `processing` tasks.
    #[must_use]
    pub const fn with_recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery_policy = policy;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
