//! Integration tests for the batch consumer.
//!
//! These tests drive the full write path into the read path:
//! 1. IngestionBuffer publishes records to the in-memory broker
//! 2. BatchConsumer polls, decodes and persists them into the in-memory store
//! 3. Committed offsets only move after a successful persist
//! 4. A restarted consumer in the same group picks up uncommitted work

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use actlog_broker::{BrokerClient, InMemoryBroker, OutgoingMessage};
use actlog_client::{
    BatchConsumer, CommitStrategy, ConsumerConfig, ConsumerStats, IngestionBuffer,
    IngestionConfig, PipelineError, Persister, RetryPolicy,
};
use actlog_core::LogEntry;
use actlog_store::InMemoryLogStore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const GROUP: &str = "activity-log-consumer";

/// Publish `n` records through a real ingestion buffer and return their ids.
async fn publish(broker: &InMemoryBroker, n: usize) -> Vec<String> {
    let client: Arc<dyn BrokerClient> = Arc::new(broker.client("producer"));
    let buffer = IngestionBuffer::new(client, IngestionConfig::default()).unwrap();
    let entries = (0..n)
        .map(|i| LogEntry::new("orders", format!("order.step-{}", i)).with_user(format!("u{}", i % 3)))
        .collect();
    let ids = buffer.submit_batch(entries).await.unwrap();
    buffer.close(Duration::from_secs(5)).await.unwrap();
    ids
}

fn consumer(
    broker: &InMemoryBroker,
    store: &Arc<InMemoryLogStore>,
    strategy: CommitStrategy,
    backoff: Duration,
) -> BatchConsumer {
    BatchConsumer::builder()
        .client(Arc::new(broker.client(GROUP)))
        .persister(Persister::new(store.clone()))
        .group_id(GROUP)
        .strategy(strategy)
        .poll_timeout(Duration::from_millis(20))
        .local_batch(5, Duration::from_millis(100))
        .shutdown_grace(Duration::from_millis(200))
        .retry_backoff(RetryPolicy::new(0, backoff, backoff * 4, 2.0))
        .build()
        .unwrap()
}

async fn wait_until<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..300 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn committed_total(broker: &InMemoryBroker, partitions: u32) -> u64 {
    let mut total = 0;
    for partition in 0..partitions {
        total += broker.committed_offset(GROUP, partition).await.unwrap_or(0);
    }
    total
}

fn stored_ids(records: &[actlog_core::Record]) -> HashSet<String> {
    records.iter().map(|r| r.id.clone()).collect()
}

#[tokio::test]
async fn test_failed_persist_is_redelivered_exactly_once_in_store() {
    let broker = InMemoryBroker::new("activity-logs", 1);
    let store = Arc::new(InMemoryLogStore::new());
    store.fail_next_inserts(1);
    let ids = publish(&broker, 3).await;

    let cancel = CancellationToken::new();
    let consumer = consumer(&broker, &store, CommitStrategy::PerDelivery, Duration::from_millis(150));
    let stats: Arc<ConsumerStats> = consumer.stats();
    let handle = consumer.spawn(cancel.clone());

    // First attempt failed: nothing committed while the redelivery backs off.
    wait_until(|| store.insert_calls() >= 1).await;
    assert_eq!(broker.committed_offset(GROUP, 0).await, None);

    wait_until(|| stats.snapshot().commits >= 1).await;
    cancel.cancel();
    let report = handle.await.unwrap().unwrap();

    assert_eq!(report.redeliveries, 1);
    assert_eq!(broker.committed_offset(GROUP, 0).await, Some(3));
    let stored = store.all().await;
    assert_eq!(stored.len(), 3);
    assert_eq!(stored_ids(&stored), ids.into_iter().collect());
}

#[tokio::test]
async fn test_partial_write_is_completed_by_redelivery() {
    let broker = InMemoryBroker::new("activity-logs", 2);
    let store = Arc::new(InMemoryLogStore::new());
    store.set_partial_writes(true);
    store.fail_next_inserts(1);
    let ids = publish(&broker, 8).await;

    let cancel = CancellationToken::new();
    let consumer = consumer(&broker, &store, CommitStrategy::PerDelivery, Duration::from_millis(10));
    let handle = consumer.spawn(cancel.clone());

    wait_until(|| store.insert_calls() >= 2).await;
    for _ in 0..100 {
        if committed_total(&broker, 2).await == 8 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(committed_total(&broker, 2).await, 8);
    let stored = store.all().await;
    assert_eq!(stored.len(), 8);
    assert_eq!(stored_ids(&stored), ids.into_iter().collect());
}

#[tokio::test]
async fn test_restarted_consumer_resumes_from_last_commit() {
    let broker = InMemoryBroker::new("activity-logs", 1);
    let store = Arc::new(InMemoryLogStore::new());
    let ids = publish(&broker, 4).await;

    // First instance never finishes its persist and is shut down.
    store.set_insert_delay(Some(Duration::from_secs(30)));
    let cancel = CancellationToken::new();
    let first = consumer(&broker, &store, CommitStrategy::PerDelivery, Duration::from_millis(10));
    let handle = first.spawn(cancel.clone());
    wait_until(|| store.insert_calls() >= 1).await;
    cancel.cancel();
    assert!(matches!(
        handle.await.unwrap(),
        Err(PipelineError::ShutdownTimeout(_))
    ));
    assert_eq!(broker.committed_offset(GROUP, 0).await, None);

    // A new instance in the same group gets the uncommitted delivery again.
    store.set_insert_delay(None);
    let cancel = CancellationToken::new();
    let second = consumer(&broker, &store, CommitStrategy::PerDelivery, Duration::from_millis(10));
    let stats = second.stats();
    let handle = second.spawn(cancel.clone());
    wait_until(|| stats.snapshot().commits >= 1).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(broker.committed_offset(GROUP, 0).await, Some(4));
    assert_eq!(stored_ids(&store.all().await), ids.into_iter().collect());
}

#[tokio::test]
async fn test_poison_only_delivery_commits_immediately() {
    for strategy in [CommitStrategy::PerDelivery, CommitStrategy::LocalBatch] {
        let broker = InMemoryBroker::new("activity-logs", 1);
        let store = Arc::new(InMemoryLogStore::new());
        broker
            .client("producer")
            .send(&[
                OutgoingMessage::new("u1", "{not json"),
                OutgoingMessage::new("u1", "[]"),
            ])
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let consumer = consumer(&broker, &store, strategy, Duration::from_millis(10));
        let handle = consumer.spawn(cancel.clone());

        for _ in 0..100 {
            if broker.committed_offset(GROUP, 0).await == Some(2) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(broker.committed_offset(GROUP, 0).await, Some(2));
        assert_eq!(store.insert_calls(), 0);
    }
}

#[tokio::test]
async fn test_local_batch_commits_once_per_batch() {
    let broker = InMemoryBroker::new("activity-logs", 1);
    let store = Arc::new(InMemoryLogStore::new());
    let ids = publish(&broker, 5).await;

    let cancel = CancellationToken::new();
    let consumer = consumer(&broker, &store, CommitStrategy::LocalBatch, Duration::from_millis(10));
    let stats = consumer.stats();
    let handle = consumer.spawn(cancel.clone());

    wait_until(|| stats.snapshot().commits >= 1).await;
    cancel.cancel();
    let report = handle.await.unwrap().unwrap();

    assert_eq!(report.commits, 1);
    assert_eq!(store.insert_calls(), 1);
    assert_eq!(broker.committed_offset(GROUP, 0).await, Some(5));
    assert_eq!(stored_ids(&store.all().await), ids.into_iter().collect());
}

#[tokio::test]
async fn test_local_batch_is_persisted_on_shutdown() {
    let broker = InMemoryBroker::new("activity-logs", 1);
    let store = Arc::new(InMemoryLogStore::new());
    publish(&broker, 2).await;

    let cancel = CancellationToken::new();
    let consumer = BatchConsumer::builder()
        .client(Arc::new(broker.client(GROUP)))
        .persister(Persister::new(store.clone()))
        .group_id(GROUP)
        .strategy(CommitStrategy::LocalBatch)
        .poll_timeout(Duration::from_millis(20))
        .local_batch(50, Duration::from_secs(60))
        .build()
        .unwrap();
    let stats = consumer.stats();
    let handle = consumer.spawn(cancel.clone());

    wait_until(|| stats.snapshot().messages >= 2).await;
    assert_eq!(store.insert_calls(), 0);
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(store.len().await, 2);
    assert_eq!(broker.committed_offset(GROUP, 0).await, Some(2));
}

#[tokio::test]
async fn test_commit_failure_leads_to_redelivery() {
    let broker = InMemoryBroker::new("activity-logs", 1);
    let store = Arc::new(InMemoryLogStore::new());
    broker.fail_next_commits(1);
    let ids = publish(&broker, 3).await;

    let cancel = CancellationToken::new();
    let consumer = consumer(&broker, &store, CommitStrategy::PerDelivery, Duration::from_millis(10));
    let stats = consumer.stats();
    let handle = consumer.spawn(cancel.clone());

    wait_until(|| stats.snapshot().commits >= 1).await;
    cancel.cancel();
    let report = handle.await.unwrap().unwrap();

    // Persisted twice, stored once.
    assert_eq!(report.redeliveries, 1);
    assert_eq!(store.insert_calls(), 2);
    assert_eq!(stored_ids(&store.all().await), ids.into_iter().collect());
    assert_eq!(broker.committed_offset(GROUP, 0).await, Some(3));
}

#[tokio::test]
async fn test_failed_local_batch_is_redelivered_across_deliveries() {
    let broker = InMemoryBroker::new("activity-logs", 2);
    let store = Arc::new(InMemoryLogStore::new());
    store.fail_next_inserts(1);
    let ids = publish(&broker, 6).await;

    // Two messages per delivery, so one local batch spans at least three.
    let cancel = CancellationToken::new();
    let consumer = BatchConsumer::builder()
        .client(Arc::new(broker.client(GROUP)))
        .persister(Persister::new(store.clone()))
        .config(ConsumerConfig {
            group_id: GROUP.to_string(),
            strategy: CommitStrategy::LocalBatch,
            max_poll_records: 2,
            poll_timeout: Duration::from_millis(20),
            batch_size: 6,
            flush_interval: Duration::from_secs(60),
            retry_backoff: RetryPolicy::new(0, Duration::from_millis(10), Duration::from_millis(40), 2.0),
            ..ConsumerConfig::default()
        })
        .build()
        .unwrap();
    let stats = consumer.stats();
    let handle = consumer.spawn(cancel.clone());

    wait_until(|| store.insert_calls() >= 1).await;
    assert_eq!(committed_total(&broker, 2).await, 0);

    wait_until(|| stats.snapshot().commits >= 1).await;
    cancel.cancel();
    let report = handle.await.unwrap().unwrap();

    assert_eq!(report.redeliveries, 1);
    assert_eq!(report.commits, 1);
    assert!(report.deliveries >= 6, "deliveries: {}", report.deliveries);
    assert_eq!(store.insert_calls(), 2);
    assert_eq!(committed_total(&broker, 2).await, 6);
    // The failed insert wrote nothing, so every record came back in the redelivery.
    let stored = store.all().await;
    assert_eq!(stored.len(), 6);
    assert_eq!(stored_ids(&stored), ids.into_iter().collect());
}
