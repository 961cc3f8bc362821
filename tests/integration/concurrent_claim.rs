//! Test: multiple worker slots racing to claim the same task.
//!
//! The claim is a conditional update guarded on `status = 'pending'`, so
//! exactly one racer wins no matter how many contend.

use tokio::task::JoinSet;

use docq::{NewTask, TaskStatus};

use crate::common::test_queue;

#[tokio::test]
async fn test_concurrent_claim_single_winner() {
    let (queue, _dir) = test_queue().await;
    let task_id = queue
        .submit(NewTask::new("contested.pdf", "/in/contested"))
        .await
        .expect("submit");

    let mut set = JoinSet::new();
    for i in 0..10 {
        let store = queue.store();
        set.spawn(async move {
            let owner = format!("racer-{i}");
            store.try_claim(task_id, &owner).await
        });
    }

    let mut winners = 0;
    let mut losers = 0;
    while let Some(result) = set.join_next().await {
        match result.expect("racer panicked").expect("claim errored") {
            true => winners += 1,
            false => losers += 1,
        }
    }

    assert_eq!(winners, 1, "exactly one racer claims the task");
    assert_eq!(losers, 9);

    let view = queue.status(task_id).await.expect("status");
    assert_eq!(view.status, TaskStatus::Processing);
}

#[tokio::test]
async fn test_claim_ignores_non_pending_rows() {
    let (queue, _dir) = test_queue().await;
    let store = queue.store();

    let task_id = queue
        .submit(NewTask::new("once.pdf", "/in/once"))
        .await
        .expect("submit");

    assert!(store.try_claim(task_id, "first").await.expect("claim"));
    // Already processing: the second claim does not apply and does not error.
    assert!(!store.try_claim(task_id, "second").await.expect("claim"));

    let view = queue.status(task_id).await.expect("status");
    assert_eq!(view.status, TaskStatus::Processing);
}
