//! Test: task admission returns unique ids and is safe under concurrency.

use tokio::task::JoinSet;
use uuid::Uuid;

use docq::{NewTask, QueueError, TaskStatus};

use crate::common::test_queue;

#[tokio::test]
async fn test_submissions_yield_distinct_pending_tasks() {
    let (queue, _dir) = test_queue().await;

    let mut ids = Vec::new();
    for i in 0..20 {
        let id = queue
            .submit(NewTask::new(format!("doc-{i}.pdf"), format!("/in/doc-{i}")))
            .await
            .expect("submit");
        ids.push(id);
    }

    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 20, "every submission gets a distinct id");

    let stats = queue.stats().await.expect("stats");
    assert_eq!(stats.total, 20);
    assert_eq!(stats.pending, 20);
}

#[tokio::test]
async fn test_concurrent_submitters() {
    let (queue, _dir) = test_queue().await;

    let mut set = JoinSet::new();
    for i in 0..10 {
        let q = queue.clone();
        set.spawn(async move {
            q.submit(NewTask::new(format!("doc-{i}.pdf"), format!("/in/doc-{i}")))
                .await
        });
    }

    let mut ids: Vec<Uuid> = Vec::new();
    while let Some(result) = set.join_next().await {
        let id = result.expect("submitter panicked").expect("submit failed");
        ids.push(id);
    }

    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 10);

    for id in ids {
        let view = queue.status(id).await.expect("status");
        assert_eq!(view.status, TaskStatus::Pending);
    }
}

#[tokio::test]
async fn test_submit_validation_and_defaults() {
    let (queue, _dir) = test_queue().await;

    let err = queue
        .submit(NewTask::new("", "/in/doc"))
        .await
        .expect_err("empty file_name rejected");
    assert!(matches!(err, QueueError::Validation(_)));

    let id = queue
        .submit(NewTask::new("doc.pdf", "/in/doc").lang("en").priority(3))
        .await
        .expect("submit");
    let view = queue.status(id).await.expect("status");
    assert_eq!(view.priority, 3);
    assert_eq!(view.file_name, "doc.pdf");
    assert!(view.started_at.is_none());
    assert!(view.completed_at.is_none());
}
