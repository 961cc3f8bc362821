//! Test: cancellation semantics across the task lifecycle.

use docq::{BackendRegistry, NewTask, QueueError, TaskStatus};
use uuid::Uuid;

use crate::common::{
    spawn_dispatcher, test_config, test_queue, wait_for_status, wait_for_terminal, InstantBackend,
    ParkedBackend,
};

#[tokio::test]
async fn test_cancel_pending_never_runs() {
    let (queue, _dir) = test_queue().await;

    // Parked at the bottom of the queue so no dispatcher could reach it
    // before the cancel lands.
    let id = queue
        .submit(NewTask::new("doomed.pdf", "/in/doomed").priority(-10))
        .await
        .expect("submit");

    let outcome = queue.cancel(id).await.expect("cancel");
    assert!(outcome.success);

    let view = queue.status(id).await.expect("status");
    assert_eq!(view.status, TaskStatus::Cancelled);
    assert!(view.started_at.is_none(), "task was never claimed");
    assert!(view.data.is_none());
    assert!(view.error_message.is_none());
}

#[tokio::test]
async fn test_cancel_processing_is_cooperative() {
    let (queue, _dir) = test_queue().await;

    let id = queue
        .submit(NewTask::new("longrun.pdf", "/in/longrun"))
        .await
        .expect("submit");

    let mut registry = BackendRegistry::new();
    registry.register(Box::new(ParkedBackend));
    let (shutdown_tx, handle) = spawn_dispatcher(&queue, registry, test_config());

    // The backend parks until cancelled, so the task sits in processing.
    wait_for_status(&queue, id, TaskStatus::Processing).await;

    let outcome = queue.cancel(id).await.expect("cancel");
    assert!(outcome.success, "processing tasks accept a cancel request");

    assert_eq!(wait_for_terminal(&queue, id).await, TaskStatus::Cancelled);

    shutdown_tx.send(true).expect("signal shutdown");
    handle.await.expect("dispatcher task").expect("clean exit");
}

#[tokio::test]
async fn test_cancel_terminal_is_rejected_not_an_error() {
    let (queue, _dir) = test_queue().await;

    let id = queue
        .submit(NewTask::new("done.pdf", "/in/done"))
        .await
        .expect("submit");

    let mut registry = BackendRegistry::new();
    registry.register(Box::new(InstantBackend));
    let (shutdown_tx, handle) = spawn_dispatcher(&queue, registry, test_config());
    assert_eq!(wait_for_terminal(&queue, id).await, TaskStatus::Completed);
    shutdown_tx.send(true).expect("signal shutdown");
    handle.await.expect("dispatcher task").expect("clean exit");

    let outcome = queue.cancel(id).await.expect("cancel call succeeds");
    assert!(!outcome.success);
    assert!(outcome.message.contains("completed"));

    // The completed result is untouched.
    let view = queue.status(id).await.expect("status");
    assert_eq!(view.status, TaskStatus::Completed);
    assert!(view.data.is_some());
}

#[tokio::test]
async fn test_cancel_unknown_task() {
    let (queue, _dir) = test_queue().await;
    let err = queue
        .cancel(Uuid::new_v4())
        .await
        .expect_err("unknown task");
    assert!(matches!(err, QueueError::NotFound { .. }));
}
