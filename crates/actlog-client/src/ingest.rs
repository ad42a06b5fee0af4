//! Ingestion Buffer
//!
//! Turns individual log writes into broker-efficient batches.
//!
//! ## Architecture
//!
//! ```text
//! submit(entry) ──► accept + encode ──► PendingBatch (mutex)
//!                                           │
//!                 ┌─────────────────────────┼──────────────────────┐
//!                 │ size: len >= batch_size │ timer: flush_interval│
//!                 └────────────┬────────────┴──────────┬───────────┘
//!                              ▼                       ▼
//!                        swap batch, cancel timer, bump generation
//!                              │
//!                              ▼  ordered channel
//!                        flush worker ──► BrokerClient::send (one per batch)
//! ```
//!
//! - `submit` never waits on broker I/O. It only holds the batch mutex long
//!   enough to append and, when the batch is full, swap it out.
//! - The first record after a flush arms a single timer. A size-triggered
//!   swap aborts it; a timer that fires anyway finds a newer generation and
//!   does nothing.
//! - Swapped batches are handed to one worker task in swap order, so records
//!   with the same partition key reach the broker in submission order.
//! - The worker retries a failed send a bounded number of times. After that
//!   the batch is logged and dropped (`actlog_records_dropped_total`).
//! - The queue to the worker is unbounded so `submit` never waits on it.
//!   Its depth is exported as `actlog_queued_flush_batches` and logged once
//!   it reaches `QUEUE_WARN_DEPTH`.
//!
//! ## Shutdown
//!
//! `close` stops accepting records, flushes what is pending, closes the
//! channel and waits for the worker to drain it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use actlog_broker::{BrokerClient, BrokerError, OutgoingMessage};
use actlog_core::{encode, EncodedRecord, LogEntry, Record};
use actlog_observability::metrics;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::batch::{FlushTrigger, PendingBatch};
use crate::error::{PipelineError, Result};
use crate::retry::{retry_with_backoff, RetryPolicy};

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(1000);

/// Queued batches at which the buffer warns that the broker is falling behind.
pub const QUEUE_WARN_DEPTH: usize = 16;

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Size trigger
    pub batch_size: usize,
    /// Time trigger, measured from the first record of a batch
    pub flush_interval: Duration,
    /// Retries applied by the flush worker to each failed send
    pub send_retry: RetryPolicy,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            send_retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of a flush that reached the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub trigger: FlushTrigger,
    pub records: usize,
}

type FlushAck = oneshot::Sender<std::result::Result<FlushReport, BrokerError>>;

struct FlushJob {
    records: Vec<EncodedRecord>,
    trigger: FlushTrigger,
    ack: Option<FlushAck>,
}

struct BufferState {
    batch: PendingBatch<EncodedRecord>,
    timer: Option<JoinHandle<()>>,
    /// `None` once closed; dropping it ends the worker.
    jobs: Option<mpsc::UnboundedSender<FlushJob>>,
    /// Batches sent to the worker and not yet delivered or dropped.
    queued: Arc<AtomicUsize>,
}

struct Inner {
    state: Mutex<BufferState>,
    flush_interval: Duration,
}

impl Inner {
    /// Swap the pending batch out and queue it for the worker. Caller holds
    /// the state lock.
    fn swap_locked(
        state: &mut BufferState,
        trigger: FlushTrigger,
        ack: Option<FlushAck>,
    ) -> Result<()> {
        let jobs = match state.jobs.as_ref() {
            Some(jobs) => jobs,
            None => return Err(PipelineError::ShuttingDown),
        };
        let records = state.batch.drain();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        metrics::BUFFERED_RECORDS.sub(records.len() as i64);

        let depth = state.queued.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::QUEUED_FLUSH_BATCHES.inc();
        let job = FlushJob {
            records,
            trigger,
            ack,
        };
        if jobs.send(job).is_err() {
            state.queued.fetch_sub(1, Ordering::SeqCst);
            metrics::QUEUED_FLUSH_BATCHES.dec();
            return Err(PipelineError::Internal("flush worker has stopped".to_string()));
        }
        if depth == QUEUE_WARN_DEPTH {
            warn!(queued_batches = depth, "Flush queue is backing up, broker is not keeping up");
        }
        Ok(())
    }

    fn arm_timer(self: &Arc<Self>, state: &mut BufferState) {
        let generation = state.batch.generation();
        let interval = self.flush_interval;
        let inner: Weak<Inner> = Arc::downgrade(self);

        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(inner) = inner.upgrade() {
                inner.flush_generation(generation).await;
            }
        }));
    }

    /// Timer path. Only flushes the batch the timer was armed for.
    async fn flush_generation(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if state.batch.generation() != generation || state.batch.is_empty() {
            return;
        }
        // Detach rather than abort: this is the timer task itself.
        state.timer.take();
        if let Err(e) = Self::swap_locked(&mut state, FlushTrigger::Timer, None) {
            warn!(error = %e, "Timer flush could not be queued");
        }
    }
}

pub struct IngestionBuffer {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    batch_size: usize,
}

impl IngestionBuffer {
    /// Create the buffer and start its flush worker on the current runtime.
    pub fn new(client: Arc<dyn BrokerClient>, config: IngestionConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(PipelineError::Config("batch_size must be at least 1".to_string()));
        }
        if config.flush_interval.is_zero() {
            return Err(PipelineError::Config(
                "flush_interval must be greater than zero".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(run_flush_worker(
            client,
            rx,
            queued.clone(),
            config.send_retry.clone(),
        ));

        info!(
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            "Ingestion buffer started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BufferState {
                    batch: PendingBatch::new(config.batch_size, config.flush_interval),
                    timer: None,
                    jobs: Some(tx),
                    queued,
                }),
                flush_interval: config.flush_interval,
            }),
            worker: Mutex::new(Some(worker)),
            batch_size: config.batch_size,
        })
    }

    /// Accept one entry and return its id. Acceptance means enqueued, not
    /// durable.
    pub async fn submit(&self, entry: LogEntry) -> Result<String> {
        let mut state = self.inner.state.lock().await;
        if state.jobs.is_none() {
            return Err(PipelineError::ShuttingDown);
        }
        let encoded = accept(entry)?;
        let id = encoded.id.clone();
        self.enqueue_locked(&mut state, encoded)?;
        Ok(id)
    }

    /// Accept several entries. They enter the pending batch in order and may
    /// span more than one flush.
    pub async fn submit_batch(&self, entries: Vec<LogEntry>) -> Result<Vec<String>> {
        let mut state = self.inner.state.lock().await;
        if state.jobs.is_none() {
            return Err(PipelineError::ShuttingDown);
        }
        let encoded = entries
            .into_iter()
            .map(accept)
            .collect::<Result<Vec<_>>>()?;
        let ids = encoded.iter().map(|r| r.id.clone()).collect();
        let count = encoded.len();
        for record in encoded {
            self.enqueue_locked(&mut state, record)?;
        }
        debug!(record_count = count, "Batch submission accepted");
        Ok(ids)
    }

    fn enqueue_locked(&self, state: &mut BufferState, record: EncodedRecord) -> Result<()> {
        if state.jobs.is_none() {
            return Err(PipelineError::ShuttingDown);
        }

        let first = state.batch.append(record);
        metrics::BUFFERED_RECORDS.inc();

        if state.batch.is_full() {
            Inner::swap_locked(state, FlushTrigger::Size, None)?;
        } else if first {
            self.inner.arm_timer(state);
        }
        Ok(())
    }

    /// Flush whatever is pending and wait until the broker accepted it.
    ///
    /// Batches swapped earlier are sent first, so when this returns every
    /// record submitted before the call has been handed to the broker or
    /// dropped after exhausting retries.
    pub async fn flush(&self) -> Result<FlushReport> {
        self.flush_with(FlushTrigger::Explicit).await
    }

    async fn flush_with(&self, trigger: FlushTrigger) -> Result<FlushReport> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().await;
            Inner::swap_locked(&mut state, trigger, Some(tx))?;
        }
        match rx.await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => Err(PipelineError::TransientBroker(e)),
            Err(_) => Err(PipelineError::Internal("flush worker dropped the batch".to_string())),
        }
    }

    /// Records waiting in the pending batch.
    pub async fn pending(&self) -> usize {
        self.inner.state.lock().await.batch.len()
    }

    /// Swapped batches the flush worker has not finished with yet.
    pub async fn queued_batches(&self) -> usize {
        self.inner.state.lock().await.queued.load(Ordering::SeqCst)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.jobs.is_none()
    }

    /// Stop accepting submissions, flush what is pending and wait up to
    /// `grace` for the worker to deliver every queued batch.
    ///
    /// Returns the final flush report. Calling `close` twice is an error.
    pub async fn close(&self, grace: Duration) -> Result<FlushReport> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().await;
            let queued = Inner::swap_locked(&mut state, FlushTrigger::Shutdown, Some(tx));
            // Closed even if the final batch could not be queued. The worker
            // exits after draining what is already queued.
            state.jobs = None;
            queued?;
        }

        let worker = self.worker.lock().await.take();
        let drained = async {
            let report = rx.await;
            if let Some(worker) = worker {
                if let Err(e) = worker.await {
                    error!(error = %e, "Flush worker panicked");
                }
            }
            report
        };

        match tokio::time::timeout(grace, drained).await {
            Ok(Ok(Ok(report))) => {
                info!(records = report.records, "Ingestion buffer closed");
                Ok(report)
            }
            Ok(Ok(Err(e))) => Err(PipelineError::TransientBroker(e)),
            Ok(Err(_)) => Err(PipelineError::Internal("flush worker dropped the batch".to_string())),
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "Final flush did not complete in time");
                Err(PipelineError::ShutdownTimeout(grace))
            }
        }
    }
}

fn accept(entry: LogEntry) -> Result<EncodedRecord> {
    let record = Record::accept(entry, Utc::now());
    metrics::RECORDS_INGESTED_TOTAL
        .with_label_values(&[record.service.as_str(), record.severity.as_str()])
        .inc();
    Ok(encode(&record)?)
}

async fn run_flush_worker(
    client: Arc<dyn BrokerClient>,
    mut jobs: mpsc::UnboundedReceiver<FlushJob>,
    queued: Arc<AtomicUsize>,
    retry: RetryPolicy,
) {
    let mut flushes: u64 = 0;
    let mut dropped: u64 = 0;

    while let Some(job) = jobs.recv().await {
        let outcome = deliver(client.as_ref(), &retry, job.records, job.trigger).await;
        queued.fetch_sub(1, Ordering::SeqCst);
        metrics::QUEUED_FLUSH_BATCHES.dec();
        match &outcome {
            Ok(report) if report.records > 0 => flushes += 1,
            Ok(_) => {}
            Err(_) => dropped += 1,
        }
        if let Some(ack) = job.ack {
            let _ = ack.send(outcome);
        }
    }

    debug!(
        total_flushes = flushes,
        dropped_batches = dropped,
        "Flush worker stopped"
    );
}

async fn deliver(
    client: &dyn BrokerClient,
    retry: &RetryPolicy,
    records: Vec<EncodedRecord>,
    trigger: FlushTrigger,
) -> std::result::Result<FlushReport, BrokerError> {
    let count = records.len();
    if count == 0 {
        return Ok(FlushReport { trigger, records: 0 });
    }

    let bytes: usize = records.iter().map(EncodedRecord::size_bytes).sum();
    let messages: Vec<OutgoingMessage> = records
        .into_iter()
        .map(|r| OutgoingMessage {
            key: Bytes::copy_from_slice(r.key.as_bytes()),
            payload: r.payload,
        })
        .collect();

    let start = Instant::now();
    let messages = &messages;
    let result = retry_with_backoff(retry, BrokerError::is_retryable, || async move {
        client.send(messages).await.map_err(|e| {
            metrics::PRODUCER_SEND_ERRORS_TOTAL.inc();
            e
        })
    })
    .await;
    metrics::FLUSH_LATENCY.observe(start.elapsed().as_secs_f64());

    match result {
        Ok(()) => {
            metrics::FLUSHES_TOTAL.with_label_values(&[trigger.as_str()]).inc();
            metrics::FLUSH_BATCH_SIZE.observe(count as f64);
            metrics::PRODUCER_MESSAGES_SENT_TOTAL.inc_by(count as u64);
            metrics::PRODUCER_BYTES_SENT_TOTAL.inc_by(bytes as u64);
            debug!(record_count = count, bytes, trigger = %trigger, "Flushed batch to broker");
            Ok(FlushReport {
                trigger,
                records: count,
            })
        }
        Err(e) => {
            metrics::RECORDS_DROPPED_TOTAL.inc_by(count as u64);
            error!(
                record_count = count,
                trigger = %trigger,
                error = %e,
                "Dropping batch after failed flush"
            );
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actlog_broker::{BrokerClient, InMemoryBroker};

    fn config(batch_size: usize, interval_ms: u64) -> IngestionConfig {
        IngestionConfig {
            batch_size,
            flush_interval: Duration::from_millis(interval_ms),
            send_retry: RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5), 2.0),
        }
    }

    fn setup(batch_size: usize, interval_ms: u64) -> (InMemoryBroker, IngestionBuffer) {
        let broker = InMemoryBroker::new("logs", 1);
        let client: Arc<dyn BrokerClient> = Arc::new(broker.client("producer"));
        let buffer = IngestionBuffer::new(client, config(batch_size, interval_ms)).unwrap();
        (broker, buffer)
    }

    #[tokio::test]
    async fn test_rejects_zero_thresholds() {
        let broker = InMemoryBroker::new("logs", 1);
        let client: Arc<dyn BrokerClient> = Arc::new(broker.client("p"));
        assert!(matches!(
            IngestionBuffer::new(client.clone(), config(0, 100)),
            Err(PipelineError::Config(_))
        ));
        assert!(matches!(
            IngestionBuffer::new(client, config(5, 0)),
            Err(PipelineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_returns_unique_ids() {
        let (_broker, buffer) = setup(10, 60_000);
        let a = buffer.submit(LogEntry::new("auth", "login")).await.unwrap();
        let b = buffer.submit(LogEntry::new("auth", "login")).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(buffer.pending().await, 2);
    }

    #[tokio::test]
    async fn test_explicit_flush_waits_for_broker() {
        let (broker, buffer) = setup(10, 60_000);
        buffer
            .submit_batch(vec![LogEntry::new("a", "x"), LogEntry::new("b", "y")])
            .await
            .unwrap();

        let report = buffer.flush().await.unwrap();
        assert_eq!(report.records, 2);
        assert_eq!(report.trigger, FlushTrigger::Explicit);
        assert_eq!(broker.total_messages().await, 2);
        assert_eq!(broker.send_count(), 1);

        // Nothing pending: a no-op flush that never calls the broker.
        assert_eq!(buffer.flush().await.unwrap().records, 0);
        assert_eq!(broker.send_count(), 1);
    }

    #[tokio::test]
    async fn test_flush_retries_transient_send_failure() {
        let (broker, buffer) = setup(10, 60_000);
        broker.fail_next_sends(2);
        buffer.submit(LogEntry::new("a", "x")).await.unwrap();

        buffer.flush().await.unwrap();
        assert_eq!(broker.total_messages().await, 1);
    }

    #[tokio::test]
    async fn test_flush_drops_batch_after_retries() {
        let (broker, buffer) = setup(10, 60_000);
        broker.set_unavailable(true);
        buffer.submit(LogEntry::new("a", "x")).await.unwrap();

        let err = buffer.flush().await.unwrap_err();
        assert!(matches!(err, PipelineError::TransientBroker(_)));

        broker.set_unavailable(false);
        assert_eq!(buffer.pending().await, 0);
        buffer.flush().await.unwrap();
        assert_eq!(broker.total_messages().await, 0);
    }

    #[tokio::test]
    async fn test_close_flushes_and_rejects_further_submissions() {
        let (broker, buffer) = setup(10, 60_000);
        buffer.submit(LogEntry::new("a", "x")).await.unwrap();

        let report = buffer.close(Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.trigger, FlushTrigger::Shutdown);
        assert_eq!(report.records, 1);
        assert_eq!(broker.total_messages().await, 1);
        assert!(buffer.is_closed().await);

        assert!(matches!(
            buffer.submit(LogEntry::new("a", "x")).await,
            Err(PipelineError::ShuttingDown)
        ));
        assert!(matches!(buffer.flush().await, Err(PipelineError::ShuttingDown)));
        assert!(matches!(
            buffer.close(Duration::from_secs(1)).await,
            Err(PipelineError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_close_marks_closed_when_worker_is_gone() {
        let (_broker, buffer) = setup(10, 60_000);
        buffer.submit(LogEntry::new("a", "x")).await.unwrap();

        let worker = buffer.worker.lock().await.take().unwrap();
        worker.abort();
        let _ = worker.await;

        assert!(matches!(
            buffer.close(Duration::from_secs(1)).await,
            Err(PipelineError::Internal(_))
        ));
        assert!(buffer.is_closed().await);
        assert!(matches!(
            buffer.submit(LogEntry::new("a", "y")).await,
            Err(PipelineError::ShuttingDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_batches_tracks_backlog() {
        let broker = InMemoryBroker::new("logs", 1);
        let client: Arc<dyn BrokerClient> = Arc::new(broker.client("producer"));
        let retry = RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(1), 1.0);
        let buffer = IngestionBuffer::new(
            client,
            IngestionConfig {
                batch_size: 1,
                flush_interval: Duration::from_secs(60),
                send_retry: retry,
            },
        )
        .unwrap();
        broker.set_unavailable(true);

        for i in 0..3 {
            buffer.submit(LogEntry::new("svc", format!("a{}", i))).await.unwrap();
        }
        // The worker is at most retrying the first batch.
        assert_eq!(buffer.queued_batches().await, 3);

        broker.set_unavailable(false);
        buffer.flush().await.unwrap();
        assert_eq!(buffer.queued_batches().await, 0);
        assert_eq!(broker.total_messages().await, 3);
    }
}
