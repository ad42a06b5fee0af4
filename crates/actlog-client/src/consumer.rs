//! Batch Consumer
//!
//! Reads deliveries from the broker, persists them and commits progress only
//! after the store confirmed the write.
//!
//! ## Delivery Cycle
//!
//! ```text
//! poll() ──► decode each message ──► resolve marker per message
//!                │ (undecodable: log, count, skip)
//!                ▼
//!          persist records  ◄── heartbeats keep the group membership alive
//!                │
//!        ┌───────┴────────┐
//!        ▼ ok             ▼ failed
//!  commit_resolved()   rewind(): drop uncommitted markers, refetch from
//!                      the last commit after a backoff
//! ```
//!
//! An undecodable message is skipped but its marker still advances, so one
//! malformed record cannot stall its partition.
//!
//! Only transient failures are redelivered. A permanent one (closed store,
//! closed broker client) stops the consumer with the delivery uncommitted.
//!
//! ## Commit Strategies
//!
//! Exactly one is active per consumer.
//!
//! - [`CommitStrategy::PerDelivery`] (default): persist every delivery as
//!   it arrives and commit right after. After a crash at most one delivery
//!   (`max_poll_records` messages) is redelivered.
//! - [`CommitStrategy::LocalBatch`]: accumulate deliveries into a local
//!   batch flushed by the same size/time triggers as the producer and commit
//!   only when that batch is persisted. Fewer, larger store writes; after a
//!   crash up to `batch_size` records plus the delivery that crossed the
//!   threshold are redelivered.
//!
//! ## Shutdown
//!
//! Cancelling the token stops polling. A persist already in flight gets
//! `shutdown_grace` to finish; it is then committed as usual. If the grace
//! period runs out, nothing is committed and `run` returns
//! [`PipelineError::ShutdownTimeout`], leaving the delivery to be redelivered.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use actlog_broker::{BrokerClient, BrokerMessage, ConsumedBatch};
use actlog_core::{decode, Record};
use actlog_observability::metrics;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::PendingBatch;
use crate::error::{PipelineError, Result};
use crate::persister::Persister;
use crate::retry::RetryPolicy;

pub const DEFAULT_CONSUMER_GROUP: &str = "activity-log-consumer";

/// How deliveries map to store writes and commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitStrategy {
    /// One store write and one commit per broker delivery.
    #[default]
    PerDelivery,
    /// One store write and one commit per local batch.
    LocalBatch,
}

impl CommitStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitStrategy::PerDelivery => "per-delivery",
            CommitStrategy::LocalBatch => "local-batch",
        }
    }
}

impl fmt::Display for CommitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommitStrategy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-delivery" => Ok(CommitStrategy::PerDelivery),
            "local-batch" => Ok(CommitStrategy::LocalBatch),
            other => Err(PipelineError::Config(format!(
                "unknown commit strategy '{}' (expected per-delivery or local-batch)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group_id: String,
    pub strategy: CommitStrategy,
    /// Upper bound on messages per delivery
    pub max_poll_records: usize,
    pub poll_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Local batch size trigger (`LocalBatch` only)
    pub batch_size: usize,
    /// Local batch time trigger (`LocalBatch` only)
    pub flush_interval: Duration,
    /// How long an in-flight persist may run once shutdown begins
    pub shutdown_grace: Duration,
    /// Backoff between a failed delivery and its redelivery, and after
    /// failed polls
    pub retry_backoff: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: DEFAULT_CONSUMER_GROUP.to_string(),
            strategy: CommitStrategy::default(),
            max_poll_records: 500,
            poll_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(3),
            batch_size: 100,
            flush_interval: Duration::from_millis(1000),
            shutdown_grace: Duration::from_secs(5),
            retry_backoff: RetryPolicy::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.group_id.is_empty() {
            return Err(PipelineError::Config("group_id must not be empty".to_string()));
        }
        if self.max_poll_records == 0 {
            return Err(PipelineError::Config(
                "max_poll_records must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(PipelineError::Config(
                "heartbeat_interval must be greater than zero".to_string(),
            ));
        }
        if self.strategy == CommitStrategy::LocalBatch
            && (self.batch_size == 0 || self.flush_interval.is_zero())
        {
            return Err(PipelineError::Config(
                "local batch size and flush interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Running totals, shared with whoever holds [`BatchConsumer::stats`].
#[derive(Debug, Default)]
pub struct ConsumerStats {
    deliveries: AtomicU64,
    messages: AtomicU64,
    decode_errors: AtomicU64,
    records_persisted: AtomicU64,
    commits: AtomicU64,
    redeliveries: AtomicU64,
    heartbeats: AtomicU64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerReport {
        ConsumerReport {
            deliveries: self.deliveries.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            records_persisted: self.records_persisted.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            redeliveries: self.redeliveries.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub deliveries: u64,
    pub messages: u64,
    pub decode_errors: u64,
    pub records_persisted: u64,
    pub commits: u64,
    pub redeliveries: u64,
    pub heartbeats: u64,
}

/// Builder for constructing a BatchConsumer.
pub struct BatchConsumerBuilder {
    client: Option<Arc<dyn BrokerClient>>,
    persister: Option<Persister>,
    config: ConsumerConfig,
}

impl BatchConsumerBuilder {
    pub fn new() -> Self {
        Self {
            client: None,
            persister: None,
            config: ConsumerConfig::default(),
        }
    }

    pub fn client(mut self, client: Arc<dyn BrokerClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn persister(mut self, persister: Persister) -> Self {
        self.persister = Some(persister);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.config.group_id = group_id.into();
        self
    }

    pub fn strategy(mut self, strategy: CommitStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout = timeout;
        self
    }

    pub fn local_batch(mut self, batch_size: usize, flush_interval: Duration) -> Self {
        self.config.batch_size = batch_size;
        self.config.flush_interval = flush_interval;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    pub fn retry_backoff(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_backoff = policy;
        self
    }

    pub fn build(self) -> Result<BatchConsumer> {
        let client = self
            .client
            .ok_or_else(|| PipelineError::Config("broker client required".into()))?;
        let persister = self
            .persister
            .ok_or_else(|| PipelineError::Config("persister required".into()))?;
        self.config.validate()?;

        Ok(BatchConsumer {
            client,
            persister,
            config: self.config,
            stats: Arc::new(ConsumerStats::default()),
        })
    }
}

impl Default for BatchConsumerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct BatchConsumer {
    client: Arc<dyn BrokerClient>,
    persister: Persister,
    config: ConsumerConfig,
    stats: Arc<ConsumerStats>,
}

impl BatchConsumer {
    pub fn builder() -> BatchConsumerBuilder {
        BatchConsumerBuilder::new()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    /// Run in the background until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<Result<ConsumerReport>> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Consume until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<ConsumerReport> {
        info!(
            group_id = %self.config.group_id,
            strategy = %self.config.strategy,
            "Batch consumer started"
        );

        let result = match self.config.strategy {
            CommitStrategy::PerDelivery => self.run_per_delivery(&cancel).await,
            CommitStrategy::LocalBatch => self.run_local_batch(&cancel).await,
        };

        let report = self.stats.snapshot();
        match &result {
            Ok(()) => info!(
                group_id = %self.config.group_id,
                deliveries = report.deliveries,
                records_persisted = report.records_persisted,
                commits = report.commits,
                redeliveries = report.redeliveries,
                "Batch consumer stopped"
            ),
            Err(e) => error!(
                group_id = %self.config.group_id,
                error = %e,
                "Batch consumer stopped with error"
            ),
        }
        result.map(|_| report)
    }

    async fn run_per_delivery(&self, cancel: &CancellationToken) -> Result<()> {
        let mut failures: usize = 0;
        let mut last_heartbeat = Instant::now();

        while !cancel.is_cancelled() {
            self.heartbeat_if_due(&mut last_heartbeat).await;

            let batch = match self.poll(cancel, self.config.poll_timeout).await? {
                Some(batch) => batch,
                None => continue,
            };

            match self.process_delivery(&batch, cancel).await {
                Ok(()) => failures = 0,
                Err(e) if e.is_transient() => {
                    failures += 1;
                    self.redeliver(&e, failures, cancel).await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Decode, persist and commit one delivery.
    async fn process_delivery(&self, batch: &ConsumedBatch, cancel: &CancellationToken) -> Result<()> {
        let records = self.decode(&batch.messages);
        self.resolve_markers(&batch.messages).await?;
        self.persist_and_commit(&records, cancel).await
    }

    async fn persist_and_commit(&self, records: &[Record], cancel: &CancellationToken) -> Result<()> {
        self.persist_with_heartbeat(records, cancel).await?;
        self.commit().await
    }

    async fn run_local_batch(&self, cancel: &CancellationToken) -> Result<()> {
        let mut local: PendingBatch<Record> =
            PendingBatch::new(self.config.batch_size, self.config.flush_interval);
        let mut failures: usize = 0;
        let mut last_heartbeat = Instant::now();

        while !cancel.is_cancelled() {
            self.heartbeat_if_due(&mut last_heartbeat).await;

            let timeout = local
                .time_remaining()
                .map_or(self.config.poll_timeout, |left| left.min(self.config.poll_timeout));
            let mut poison_only = false;

            if let Some(batch) = self.poll(cancel, timeout).await? {
                let records = self.decode(&batch.messages);
                if let Err(e) = self.resolve_markers(&batch.messages).await {
                    if !e.is_transient() {
                        return Err(e);
                    }
                    failures += 1;
                    local.drain();
                    self.redeliver(&e, failures, cancel).await;
                    continue;
                }
                poison_only = records.is_empty() && local.is_empty();
                for record in records {
                    local.append(record);
                }
            }

            if !(local.is_full() || local.is_expired() || poison_only) {
                continue;
            }

            let records = local.drain();
            match self.persist_and_commit(&records, cancel).await {
                Ok(()) => failures = 0,
                Err(e) if e.is_transient() => {
                    failures += 1;
                    self.redeliver(&e, failures, cancel).await;
                }
                Err(e) => return Err(e),
            }
        }

        // Persist what was accumulated before the shutdown, within the grace
        // period.
        if !local.is_empty() {
            let records = local.drain();
            debug!(record_count = records.len(), "Flushing local batch on shutdown");
            self.persist_and_commit(&records, cancel).await?;
        }
        Ok(())
    }

    /// Poll once. `None` on an empty delivery, cancellation or a transient
    /// poll failure (after backing off).
    async fn poll(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<Option<ConsumedBatch>> {
        let result = tokio::select! {
            result = self.client.poll(self.config.max_poll_records, timeout) => result,
            _ = cancel.cancelled() => return Ok(None),
        };

        match result {
            Ok(batch) if batch.is_empty() => Ok(None),
            Ok(batch) => {
                self.stats.deliveries.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .messages
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                metrics::CONSUMER_MESSAGES_TOTAL
                    .with_label_values(&[self.config.group_id.as_str()])
                    .inc_by(batch.len() as u64);
                debug!(
                    message_count = batch.len(),
                    partitions = ?batch.last_offsets(),
                    "Received delivery"
                );
                Ok(Some(batch))
            }
            Err(e) if e.is_retryable() => {
                metrics::CONSUMER_ERRORS_TOTAL
                    .with_label_values(&[self.config.group_id.as_str(), "poll"])
                    .inc();
                warn!(error = %e, "Poll failed, backing off");
                self.backoff(0, cancel).await;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Decode every message, skipping the ones that fail.
    fn decode(&self, messages: &[BrokerMessage]) -> Vec<Record> {
        let mut records = Vec::with_capacity(messages.len());
        for msg in messages {
            match decode(&msg.payload) {
                Ok(record) => records.push(record),
                Err(e) => {
                    self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                    metrics::DECODE_ERRORS_TOTAL
                        .with_label_values(&[self.config.group_id.as_str()])
                        .inc();
                    warn!(
                        partition = msg.partition,
                        offset = msg.offset,
                        error = %e,
                        "Skipping undecodable message"
                    );
                }
            }
        }
        records
    }

    async fn resolve_markers(&self, messages: &[BrokerMessage]) -> Result<()> {
        for msg in messages {
            self.client.resolve_marker(msg.partition, msg.offset).await?;
        }
        Ok(())
    }

    /// Persist while heartbeating. Once `cancel` fires the persist has
    /// `shutdown_grace` left before it is abandoned.
    async fn persist_with_heartbeat(
        &self,
        records: &[Record],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let persist = self.persister.persist(records);
        tokio::pin!(persist);

        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut grace_deadline: Option<Instant> = None;

        loop {
            let deadline = grace_deadline;
            let grace_elapsed = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                result = &mut persist => {
                    let written = result?;
                    self.stats
                        .records_persisted
                        .fetch_add(written as u64, Ordering::Relaxed);
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    self.send_heartbeat().await;
                }
                _ = cancel.cancelled(), if grace_deadline.is_none() => {
                    debug!(
                        record_count = records.len(),
                        grace_ms = self.config.shutdown_grace.as_millis() as u64,
                        "Shutdown requested while persisting, waiting for grace period"
                    );
                    grace_deadline = Some(Instant::now() + self.config.shutdown_grace);
                }
                _ = grace_elapsed => {
                    warn!(
                        record_count = records.len(),
                        "In-flight persist exceeded shutdown grace period, leaving delivery uncommitted"
                    );
                    return Err(PipelineError::ShutdownTimeout(self.config.shutdown_grace));
                }
            }
        }
    }

    async fn commit(&self) -> Result<()> {
        self.client.commit_resolved().await?;
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        metrics::COMMITS_TOTAL
            .with_label_values(&[self.config.group_id.as_str()])
            .inc();
        debug!(group_id = %self.config.group_id, "Committed resolved markers");
        Ok(())
    }

    /// Leave the failed delivery uncommitted and rewind so it comes back.
    async fn redeliver(&self, cause: &PipelineError, failures: usize, cancel: &CancellationToken) {
        self.stats.redeliveries.fetch_add(1, Ordering::Relaxed);
        metrics::REDELIVERIES_TOTAL
            .with_label_values(&[self.config.group_id.as_str()])
            .inc();
        metrics::CONSUMER_ERRORS_TOTAL
            .with_label_values(&[self.config.group_id.as_str(), cause.kind()])
            .inc();
        warn!(
            group_id = %self.config.group_id,
            error = %cause,
            consecutive_failures = failures,
            "Delivery not committed, rewinding for redelivery"
        );

        if let Err(e) = self.client.rewind().await {
            error!(error = %e, "Rewind failed");
        }
        self.backoff(failures.saturating_sub(1), cancel).await;
    }

    async fn backoff(&self, attempt: usize, cancel: &CancellationToken) {
        let delay = self.config.retry_backoff.backoff(attempt);
        tokio::select! {
            _ = sleep(delay) => {}
            _ = cancel.cancelled() => {}
        }
    }

    async fn heartbeat_if_due(&self, last: &mut Instant) {
        if last.elapsed() >= self.config.heartbeat_interval {
            self.send_heartbeat().await;
            *last = Instant::now();
        }
    }

    async fn send_heartbeat(&self) {
        match self.client.heartbeat().await {
            Ok(()) => {
                self.stats.heartbeats.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                metrics::CONSUMER_ERRORS_TOTAL
                    .with_label_values(&[self.config.group_id.as_str(), "heartbeat"])
                    .inc();
                warn!(error = %e, "Heartbeat failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actlog_broker::{InMemoryBroker, OutgoingMessage};
    use actlog_core::{encode, LogEntry};
    use actlog_store::{InMemoryLogStore, LogStore, StoreError};
    use chrono::Utc;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(0, Duration::from_millis(5), Duration::from_millis(20), 2.0)
    }

    fn consumer(
        broker: &InMemoryBroker,
        store: &Arc<InMemoryLogStore>,
        strategy: CommitStrategy,
    ) -> BatchConsumer {
        BatchConsumer::builder()
            .client(Arc::new(broker.client("test-group")))
            .persister(Persister::new(store.clone()))
            .group_id("test-group")
            .strategy(strategy)
            .poll_timeout(Duration::from_millis(20))
            .local_batch(4, Duration::from_millis(50))
            .retry_backoff(fast_retry())
            .build()
            .unwrap()
    }

    fn message(record: &Record) -> OutgoingMessage {
        let encoded = encode(record).unwrap();
        OutgoingMessage::new(encoded.key.as_str().to_string(), encoded.payload)
    }

    async fn publish(broker: &InMemoryBroker, n: usize) -> Vec<Record> {
        let records: Vec<Record> = (0..n)
            .map(|i| Record::accept(LogEntry::new("svc", format!("a{}", i)).with_user("u1"), Utc::now()))
            .collect();
        let messages: Vec<_> = records.iter().map(message).collect();
        broker.client("producer").send(&messages).await.unwrap();
        records
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "per-delivery".parse::<CommitStrategy>().unwrap(),
            CommitStrategy::PerDelivery
        );
        assert_eq!(
            " Local-Batch ".parse::<CommitStrategy>().unwrap(),
            CommitStrategy::LocalBatch
        );
        assert!("exactly-once".parse::<CommitStrategy>().is_err());
        assert_eq!(CommitStrategy::default().to_string(), "per-delivery");
    }

    #[test]
    fn test_builder_requires_dependencies() {
        assert!(matches!(
            BatchConsumer::builder().build(),
            Err(PipelineError::Config(_))
        ));

        let broker = InMemoryBroker::new("logs", 1);
        let store = Arc::new(InMemoryLogStore::new());
        let result = BatchConsumer::builder()
            .client(Arc::new(broker.client("g")))
            .persister(Persister::new(store))
            .strategy(CommitStrategy::LocalBatch)
            .local_batch(0, Duration::from_millis(10))
            .build();
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[tokio::test]
    async fn test_per_delivery_persists_then_commits() {
        let broker = InMemoryBroker::new("logs", 1);
        let store = Arc::new(InMemoryLogStore::new());
        let records = publish(&broker, 3).await;

        let cancel = CancellationToken::new();
        let consumer = consumer(&broker, &store, CommitStrategy::PerDelivery);
        let stats = consumer.stats();
        let handle = consumer.spawn(cancel.clone());

        wait_for(|| stats.snapshot().commits >= 1).await;
        cancel.cancel();
        let report = handle.await.unwrap().unwrap();

        assert_eq!(report.records_persisted, 3);
        assert_eq!(store.len().await, 3);
        assert_eq!(broker.committed_offset("test-group", 0).await, Some(3));
        for record in &records {
            assert!(store.all().await.iter().any(|r| r.id == record.id));
        }
    }

    #[tokio::test]
    async fn test_poison_message_is_skipped_and_committed() {
        let broker = InMemoryBroker::new("logs", 1);
        let store = Arc::new(InMemoryLogStore::new());
        broker
            .client("producer")
            .send(&[OutgoingMessage::new("u1", "not json")])
            .await
            .unwrap();
        publish(&broker, 1).await;

        let cancel = CancellationToken::new();
        let consumer = consumer(&broker, &store, CommitStrategy::PerDelivery);
        let stats = consumer.stats();
        let handle = consumer.spawn(cancel.clone());

        wait_for(|| stats.snapshot().records_persisted >= 1).await;
        cancel.cancel();
        let report = handle.await.unwrap().unwrap();

        assert_eq!(report.decode_errors, 1);
        assert_eq!(store.len().await, 1);
        assert_eq!(broker.committed_offset("test-group", 0).await, Some(2));
    }

    #[tokio::test]
    async fn test_local_batch_waits_for_size_or_time() {
        let broker = InMemoryBroker::new("logs", 1);
        let store = Arc::new(InMemoryLogStore::new());
        publish(&broker, 2).await;

        let cancel = CancellationToken::new();
        let consumer = consumer(&broker, &store, CommitStrategy::LocalBatch);
        let stats = consumer.stats();
        let handle = consumer.spawn(cancel.clone());

        // Two records are below the size trigger; the 50ms timer flushes them.
        wait_for(|| stats.snapshot().commits >= 1).await;
        assert_eq!(store.insert_calls(), 1);
        assert_eq!(broker.committed_offset("test-group", 0).await, Some(2));

        // Four more fill the local batch.
        publish(&broker, 4).await;
        wait_for(|| stats.snapshot().commits >= 2).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(store.len().await, 6);
        assert_eq!(broker.committed_offset("test-group", 0).await, Some(6));
    }

    #[tokio::test]
    async fn test_heartbeats_during_slow_persist() {
        let broker = InMemoryBroker::new("logs", 1);
        let store = Arc::new(InMemoryLogStore::new());
        store.set_insert_delay(Some(Duration::from_millis(120)));
        publish(&broker, 1).await;

        let cancel = CancellationToken::new();
        let consumer = BatchConsumer::builder()
            .client(Arc::new(broker.client("g")))
            .persister(Persister::new(store.clone()))
            .config(ConsumerConfig {
                group_id: "g".to_string(),
                heartbeat_interval: Duration::from_millis(25),
                poll_timeout: Duration::from_millis(20),
                ..ConsumerConfig::default()
            })
            .build()
            .unwrap();
        let stats = consumer.stats();
        let handle = consumer.spawn(cancel.clone());

        wait_for(|| stats.snapshot().commits >= 1).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert!(broker.heartbeat_count() >= 2);
    }

    #[tokio::test]
    async fn test_shutdown_timeout_leaves_delivery_uncommitted() {
        let broker = InMemoryBroker::new("logs", 1);
        let store = Arc::new(InMemoryLogStore::new());
        store.set_insert_delay(Some(Duration::from_secs(30)));
        publish(&broker, 2).await;

        let cancel = CancellationToken::new();
        let consumer = BatchConsumer::builder()
            .client(Arc::new(broker.client("g")))
            .persister(Persister::new(store.clone()))
            .group_id("g")
            .poll_timeout(Duration::from_millis(20))
            .shutdown_grace(Duration::from_millis(50))
            .build()
            .unwrap();
        let handle = consumer.spawn(cancel.clone());

        wait_for(|| store.insert_calls() >= 1).await;
        cancel.cancel();
        let result = handle.await.unwrap();

        assert!(matches!(result, Err(PipelineError::ShutdownTimeout(_))));
        assert_eq!(broker.committed_offset("g", 0).await, None);
        assert!(store.is_empty().await);
    }
    #[tokio::test]
    async fn test_closed_store_stops_consumer_without_commit() {
        let broker = InMemoryBroker::new("logs", 1);
        let store = Arc::new(InMemoryLogStore::new());
        store.close().await.unwrap();
        publish(&broker, 2).await;

        for strategy in [CommitStrategy::PerDelivery, CommitStrategy::LocalBatch] {
            let consumer = consumer(&broker, &store, strategy);
            let stats = consumer.stats();
            let result = tokio::time::timeout(
                Duration::from_secs(5),
                consumer.run(CancellationToken::new()),
            )
            .await
            .expect("consumer should stop on its own");

            assert!(matches!(
                result,
                Err(PipelineError::TransientStore(StoreError::Closed))
            ));
            assert_eq!(stats.snapshot().redeliveries, 0);
            assert_eq!(broker.committed_offset("test-group", 0).await, None);
        }
    }
}
