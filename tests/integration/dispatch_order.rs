//! Test: dispatch order is priority first, admission time second.

use docq::{NewTask, TaskStatus};

use crate::common::{
    spawn_dispatcher, test_config, test_queue, wait_for_terminal, InstantBackend,
};
use docq::BackendRegistry;

#[tokio::test]
async fn test_priority_beats_admission_order() {
    let (queue, _dir) = test_queue().await;
    let store = queue.store();

    // Admitted first, but lowest priority.
    let low = queue
        .submit(NewTask::new("low.pdf", "/in/low").priority(-5))
        .await
        .expect("submit");
    let normal = queue
        .submit(NewTask::new("normal.pdf", "/in/normal"))
        .await
        .expect("submit");
    let high = queue
        .submit(NewTask::new("high.pdf", "/in/high").priority(10))
        .await
        .expect("submit");

    // Claim one at a time and observe the order the store hands them out.
    for expected in [high, normal, low] {
        let next = store
            .next_pending()
            .await
            .expect("scan")
            .expect("candidate available");
        assert_eq!(next, expected);
        assert!(store.try_claim(next, "order-test").await.expect("claim"));
    }

    assert!(store.next_pending().await.expect("scan").is_none());
}

#[tokio::test]
async fn test_equal_priority_is_fifo() {
    let (queue, _dir) = test_queue().await;
    let store = queue.store();

    let mut expected = Vec::new();
    for i in 0..5 {
        let id = queue
            .submit(NewTask::new(format!("doc-{i}.pdf"), "/in/doc").priority(7))
            .await
            .expect("submit");
        expected.push(id);
    }

    for id in expected {
        let next = store
            .next_pending()
            .await
            .expect("scan")
            .expect("candidate available");
        assert_eq!(next, id, "equal priorities drain oldest first");
        assert!(store.try_claim(next, "fifo-test").await.expect("claim"));
    }
}

#[tokio::test]
async fn test_dispatcher_completes_backlog() {
    let (queue, _dir) = test_queue().await;

    let mut ids = Vec::new();
    for i in 0..8 {
        let id = queue
            .submit(NewTask::new(format!("doc-{i}.pdf"), "/in/doc").priority(i))
            .await
            .expect("submit");
        ids.push(id);
    }

    let mut registry = BackendRegistry::new();
    registry.register(Box::new(InstantBackend));
    let (shutdown_tx, handle) = spawn_dispatcher(&queue, registry, test_config());

    for id in &ids {
        assert_eq!(wait_for_terminal(&queue, *id).await, TaskStatus::Completed);
    }

    shutdown_tx.send(true).expect("signal shutdown");
    handle.await.expect("dispatcher task").expect("clean exit");

    let stats = queue.stats().await.expect("stats");
    assert_eq!(stats.completed, 8);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, 0);
}
