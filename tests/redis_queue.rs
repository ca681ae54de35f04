//! Integration tests for the queue over a real Redis server.
//!
//! Run with: REDIS_URL=redis://127.0.0.1:6379 cargo test --test redis_queue -- --ignored

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use swarm_dispatch::queue::{
    completion_queue_for, names, MessageQueue, QueueConfigRegistry, QueueConfiguration, RedisStore,
    RejectOutcome,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Job {
    name: String,
}

fn job(name: &str) -> Job {
    Job {
        name: name.to_string(),
    }
}

async fn create_test_queue() -> MessageQueue {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let store = RedisStore::connect(&url)
        .await
        .expect("Redis should be reachable for integration tests");
    MessageQueue::new(Arc::new(store), QueueConfigRegistry::with_predefined())
        .with_poll_interval(Duration::from_millis(10))
}

fn unique(prefix: &str) -> String {
    format!("{}.test-{}", prefix, Uuid::new_v4())
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_queue -- --ignored
async fn test_priority_then_fifo_order() {
    let queue = create_test_queue().await;
    let name = unique(names::FUNCTION_ASSIGNMENTS);

    queue.send_priority(&name, &job("low"), -5, None).await.expect("send should work");
    queue.send_priority(&name, &job("first-high"), 900, None).await.expect("send should work");
    queue.send_priority(&name, &job("second-high"), 900, None).await.expect("send should work");
    queue.send(&name, &job("fifo"), None).await.expect("send should work");

    let mut order = Vec::new();
    while let Some(item) = queue.receive::<Job>(&name).await.expect("receive should work") {
        order.push(item.data.name.clone());
        queue.acknowledge(&item).await.expect("ack should work");
    }
    assert_eq!(order, vec!["first-high", "second-high", "low", "fifo"]);

    let stats = queue.stats(&name).await.expect("stats should work");
    assert_eq!(stats.sent, 4);
    assert_eq!(stats.acknowledged, 4);
    queue.delete_queue(&name).await.expect("delete should work");
}

#[tokio::test]
#[ignore]
async fn test_completion_queue_inherits_prefix_config() {
    let queue = create_test_queue().await;
    let name = completion_queue_for(&Uuid::new_v4().to_string());

    let config = queue.configuration(&name).await.expect("config should resolve");
    assert!(config.enable_priority);
    assert_eq!(config.max_message_size_bytes, 2048);

    queue.send(&name, &job("done"), None).await.expect("send should work");
    let item = queue
        .receive_blocking::<Job>(&name, Duration::from_secs(1), &CancellationToken::new())
        .await
        .expect("receive should work")
        .expect("message should arrive");
    assert_eq!(item.data, job("done"));
    queue.delete_queue(&name).await.expect("delete should work");
}

#[tokio::test]
#[ignore]
async fn test_persisted_config_survives_new_client() {
    let name = unique("custom");
    let first = create_test_queue().await;
    first
        .create_queue(
            &name,
            Some(QueueConfiguration::new(true, 1024, Duration::from_secs(60)).with_max_retries(1)),
        )
        .await
        .expect("create should work");

    let second = create_test_queue().await;
    let config = second.configuration(&name).await.expect("config should resolve");
    assert!(config.enable_priority);
    assert_eq!(config.max_message_size_bytes, 1024);
    assert_eq!(config.max_retries, 1);
    first.delete_queue(&name).await.expect("delete should work");
}

#[tokio::test]
#[ignore]
async fn test_reject_exhausts_retries_into_dead_letter() {
    let queue = create_test_queue().await;
    let name = unique("jobs");
    queue
        .create_queue(
            &name,
            Some(QueueConfiguration::new(false, 4096, Duration::from_secs(60)).with_max_retries(1)),
        )
        .await
        .expect("create should work");
    queue.send(&name, &job("flaky"), None).await.expect("send should work");

    let item = queue.receive::<Job>(&name).await.expect("receive should work").expect("item");
    let outcome = queue.reject(item, true, "first failure").await.expect("reject should work");
    assert_eq!(outcome, RejectOutcome::Requeued);

    let item = queue.receive::<Job>(&name).await.expect("receive should work").expect("item");
    let outcome = queue.reject(item, true, "second failure").await.expect("reject should work");
    assert_eq!(outcome, RejectOutcome::DeadLettered);

    let stats = queue.stats(&name).await.expect("stats should work");
    assert_eq!(stats.pending(), 0);
    assert_eq!(stats.dead_letter_depth, 1);
    queue.delete_queue(&name).await.expect("delete should work");
}
