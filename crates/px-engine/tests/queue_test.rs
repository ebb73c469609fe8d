use std::sync::Arc;
use std::time::Duration as StdDuration;

use px_core::bus::EventBus;
use px_core::store::Store;
use px_core::types::{Task, TaskStatus, TaskType};
use px_core::CoreError;
use px_engine::queue::{QueueSettings, TaskQueue};
use px_engine::shutdown::ShutdownSignal;

async fn queue_with_settings(settings: QueueSettings) -> (TaskQueue, EventBus) {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let bus = EventBus::new();
    let queue = TaskQueue::new(store, bus.clone(), settings, ShutdownSignal::new());
    (queue, bus)
}

async fn queue() -> (TaskQueue, EventBus) {
    queue_with_settings(QueueSettings::default()).await
}

#[tokio::test]
async fn enqueue_rejects_empty_target() {
    let (queue, _bus) = queue().await;
    let task = Task::new(TaskType::DeployPipeline, "  ");
    let err = queue.enqueue(task).await.unwrap_err();
    assert!(matches!(err, CoreError::Validation { .. }));
}

#[tokio::test]
async fn zero_wait_lease_on_empty_queue_returns_immediately() {
    let (queue, _bus) = queue().await;
    let started = tokio::time::Instant::now();
    let leased = queue.lease("h1", &[], StdDuration::ZERO).await.unwrap();
    assert!(leased.is_none());
    assert!(started.elapsed() < StdDuration::from_millis(200));
}

#[tokio::test]
async fn enqueue_wakes_blocked_poller() {
    let (queue, _bus) = queue().await;
    let queue = Arc::new(queue);

    let poller = {
        let queue = queue.clone();
        tokio::spawn(async move {
            queue
                .lease("h1", &[], StdDuration::from_secs(10))
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(StdDuration::from_millis(100)).await;

    let task = Task::new(TaskType::DeployPipeline, "h1");
    queue.enqueue(task.clone()).await.unwrap();

    let leased = tokio::time::timeout(StdDuration::from_secs(2), poller)
        .await
        .expect("poller should wake promptly")
        .unwrap()
        .expect("task expected");
    assert_eq!(leased.id, task.id);
}

#[tokio::test]
async fn concurrent_pollers_observe_at_most_one_lease() {
    let (queue, _bus) = queue().await;
    let queue = Arc::new(queue);
    queue
        .enqueue(Task::new(TaskType::DeployPipeline, "h1"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue.lease("h1", &[], StdDuration::ZERO).await.unwrap()
        }));
    }
    let mut hits = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            hits += 1;
        }
    }
    assert_eq!(hits, 1);
}

#[tokio::test]
async fn capability_selector_reaches_capable_agent() {
    let (queue, _bus) = queue().await;
    queue
        .enqueue(Task::new(TaskType::LoadsimStart, "cap:loadsim"))
        .await
        .unwrap();

    assert!(queue
        .lease("plain-host", &[], StdDuration::ZERO)
        .await
        .unwrap()
        .is_none());
    let leased = queue
        .lease("sim-host", &["loadsim".to_string()], StdDuration::ZERO)
        .await
        .unwrap()
        .expect("capable agent should receive the task");
    assert_eq!(leased.leased_by.as_deref(), Some("sim-host"));
}

#[tokio::test]
async fn heartbeat_after_lease_expiry_is_lease_lost() {
    let settings = QueueSettings {
        lease_duration: chrono::Duration::milliseconds(20),
        ..QueueSettings::default()
    };
    let (queue, _bus) = queue_with_settings(settings).await;
    let task = Task::new(TaskType::DeployPipeline, "h1");
    queue.enqueue(task.clone()).await.unwrap();
    queue
        .lease("h1", &[], StdDuration::ZERO)
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(StdDuration::from_millis(50)).await;
    queue.reap_expired_leases().await.unwrap();

    let err = queue.heartbeat(&task.id, "h1").await.unwrap_err();
    assert!(matches!(err, CoreError::LeaseLost { .. }));
}

#[tokio::test]
async fn crashed_agent_lease_is_retried_by_next_agent() {
    // Scenario: agent h1 leases and crashes; after expiry + reap the task
    // is pending again with one attempt burned, and a second lease
    // completes it.
    let settings = QueueSettings {
        lease_duration: chrono::Duration::milliseconds(20),
        ..QueueSettings::default()
    };
    let (queue, _bus) = queue_with_settings(settings).await;
    let task = Task::new(TaskType::DeployPipeline, "h1");
    queue.enqueue(task.clone()).await.unwrap();

    let first = queue
        .lease("h1", &[], StdDuration::ZERO)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.attempts, 1);

    tokio::time::sleep(StdDuration::from_millis(50)).await;
    let outcome = queue.reap_expired_leases().await.unwrap();
    assert_eq!(outcome.requeued.len(), 1);

    let second = queue
        .lease("h1", &[], StdDuration::ZERO)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.attempts, 2);
    let done = queue
        .complete(&task.id, "h1", Some(serde_json::json!({"applied": true})))
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Succeeded);
    assert_eq!(done.attempts, 2);
}

#[tokio::test]
async fn duplicate_complete_after_requeue_is_rejected() {
    let settings = QueueSettings {
        lease_duration: chrono::Duration::milliseconds(20),
        ..QueueSettings::default()
    };
    let (queue, _bus) = queue_with_settings(settings).await;
    let task = Task::new(TaskType::DeployPipeline, "h1");
    queue.enqueue(task.clone()).await.unwrap();
    queue
        .lease("h1", &[], StdDuration::ZERO)
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(StdDuration::from_millis(50)).await;
    queue.reap_expired_leases().await.unwrap();
    // The task may have been leased and executed elsewhere by now; the
    // original holder's ack must not be silently accepted.
    let err = queue.complete(&task.id, "h1", None).await.unwrap_err();
    assert!(matches!(err, CoreError::LeaseLost { .. }));
}

#[tokio::test]
async fn non_retriable_failure_emits_task_failed() {
    let (queue, bus) = queue().await;
    let sub = bus.subscribe(&["task.failed"]);
    let task = Task::new(TaskType::DeployPipeline, "h1");
    queue.enqueue(task.clone()).await.unwrap();
    queue
        .lease("h1", &[], StdDuration::ZERO)
        .await
        .unwrap()
        .unwrap();

    let failed = queue
        .fail(&task.id, "h1", "bad collector config", false)
        .await
        .unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);

    let event = sub.recv().await.unwrap();
    assert_eq!(event.kind, "task.failed");
    assert_eq!(event.data["task_id"], task.id.as_str());
}

#[tokio::test]
async fn shutdown_unblocks_long_poll() {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let shutdown = ShutdownSignal::new();
    let queue = Arc::new(TaskQueue::new(
        store,
        EventBus::new(),
        QueueSettings::default(),
        shutdown.clone(),
    ));

    let poller = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.lease("h1", &[], StdDuration::from_secs(30)).await })
    };
    tokio::time::sleep(StdDuration::from_millis(100)).await;
    shutdown.trigger();

    let result = tokio::time::timeout(StdDuration::from_secs(2), poller)
        .await
        .expect("shutdown should unblock the poll")
        .unwrap()
        .unwrap();
    assert!(result.is_none());
}
