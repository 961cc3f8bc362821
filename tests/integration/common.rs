//! Common test utilities.
//!
//! Every test gets its own temporary database file, so tests are fully
//! isolated and can run in parallel.

use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use docq::worker::{BackendError, ParseRequest, ParserBackend};
use docq::{
    shutdown_signal, BackendRegistry, Dispatcher, ParseResult, Queue, QueueConfig, QueueError,
    TaskStatus, TaskStore,
};

static TRACING: Once = Once::new();

/// Installs a log subscriber once per test binary. Filtered by `RUST_LOG`,
/// e.g. `RUST_LOG=docq=debug cargo test --test integration`.
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Creates a queue backed by a fresh temporary database.
///
/// The `TempDir` must be kept alive for the duration of the test.
pub async fn test_queue() -> (Queue, TempDir) {
    init_tracing();
    let dir = TempDir::new().expect("create temp dir");
    let store = TaskStore::open(dir.path().join("tasks.db"))
        .await
        .expect("open store");
    (Queue::with_store(store), dir)
}

/// Configuration tuned for fast test turnaround.
pub fn test_config() -> QueueConfig {
    let mut config = QueueConfig::default().with_workers(2);
    config.poll_interval = Duration::from_millis(10);
    config.cancel_poll_interval = Duration::from_millis(20);
    config.shutdown_grace_period = Duration::from_secs(5);
    config
}

/// Spawns a dispatcher over the queue's store and returns its shutdown
/// handle and join handle.
pub fn spawn_dispatcher(
    queue: &Queue,
    registry: BackendRegistry,
    config: QueueConfig,
) -> (watch::Sender<bool>, JoinHandle<Result<(), QueueError>>) {
    let dispatcher = Dispatcher::new(queue.store(), Arc::new(registry), config);
    let (shutdown_tx, shutdown_rx) = shutdown_signal();
    let handle = tokio::spawn(dispatcher.run(shutdown_rx));
    (shutdown_tx, handle)
}

/// Polls until the task reaches the given status, panicking after ~2s.
pub async fn wait_for_status(queue: &Queue, task_id: Uuid, status: TaskStatus) {
    for _ in 0..200 {
        let view = queue.status(task_id).await.expect("status lookup");
        if view.status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached {status}");
}

/// Polls until the task is in any terminal status and returns it.
pub async fn wait_for_terminal(queue: &Queue, task_id: Uuid) -> TaskStatus {
    for _ in 0..200 {
        let view = queue.status(task_id).await.expect("status lookup");
        if view.status.is_terminal() {
            return view.status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached a terminal status");
}

/// Backend that succeeds immediately, echoing the file name back.
pub struct InstantBackend;

#[async_trait]
impl ParserBackend for InstantBackend {
    fn variant(&self) -> &str {
        "pipeline"
    }

    async fn parse(
        &self,
        request: ParseRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<ParseResult, BackendError> {
        Ok(ParseResult {
            markdown_file: Some(format!("{}.md", request.file_name)),
            content: format!("# {}", request.file_name),
            has_images: false,
        })
    }
}

/// Backend that always fails.
pub struct FailingBackend;

#[async_trait]
impl ParserBackend for FailingBackend {
    fn variant(&self) -> &str {
        "pipeline"
    }

    async fn parse(
        &self,
        _request: ParseRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<ParseResult, BackendError> {
        Err(BackendError::new("synthetic parse failure"))
    }
}

/// Backend that parks until its cancellation token fires, then reports
/// cooperative cancellation. Used to observe `processing` mid-flight.
pub struct ParkedBackend;

#[async_trait]
impl ParserBackend for ParkedBackend {
    fn variant(&self) -> &str {
        "pipeline"
    }

    async fn parse(
        &self,
        _request: ParseRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<ParseResult, BackendError> {
        cancel.cancelled().await;
        Err(BackendError::cancelled())
    }
}
