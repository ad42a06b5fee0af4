use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Ingestion Metrics
    // ============================================================================

    /// Records accepted into the ingestion buffer
    pub static ref RECORDS_INGESTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("actlog_records_ingested_total", "Total records accepted for ingestion"),
        &["service", "severity"]
    ).expect("metric can be created");

    /// Records currently waiting in the pending batch
    pub static ref BUFFERED_RECORDS: IntGauge = IntGauge::new(
        "actlog_buffered_records",
        "Records waiting in the pending producer batch"
    ).expect("metric can be created");

    /// Flushes by trigger (size, timer, explicit, shutdown)
    pub static ref FLUSHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("actlog_flushes_total", "Total producer batch flushes"),
        &["trigger"]
    ).expect("metric can be created");

    /// Records per flushed batch
    pub static ref FLUSH_BATCH_SIZE: Histogram = Histogram::with_opts(
        HistogramOpts::new("actlog_flush_batch_size", "Producer batch size in records")
            .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
    ).expect("metric can be created");

    /// Time to hand a batch to the broker, retries included
    pub static ref FLUSH_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new("actlog_flush_latency_seconds", "Producer flush latency in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
    ).expect("metric can be created");

    /// Messages handed to the broker
    pub static ref PRODUCER_MESSAGES_SENT_TOTAL: IntCounter = IntCounter::new(
        "actlog_producer_messages_sent_total",
        "Total messages sent to the broker"
    ).expect("metric can be created");

    /// Failed send attempts
    pub static ref PRODUCER_SEND_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "actlog_producer_send_errors_total",
        "Total failed broker send attempts"
    ).expect("metric can be created");

    /// Records lost after a flush exhausted its retries
    pub static ref RECORDS_DROPPED_TOTAL: IntCounter = IntCounter::new(
        "actlog_records_dropped_total",
        "Total records dropped after failed flushes"
    ).expect("metric can be created");

    /// Key and payload bytes handed to the broker
    pub static ref PRODUCER_BYTES_SENT_TOTAL: IntCounter = IntCounter::new(
        "actlog_producer_bytes_sent_total",
        "Total bytes sent to the broker"
    ).expect("metric can be created");

    /// Swapped batches waiting for (or being sent by) the flush worker
    pub static ref QUEUED_FLUSH_BATCHES: IntGauge = IntGauge::new(
        "actlog_queued_flush_batches",
        "Batches queued for the producer flush worker"
    ).expect("metric can be created");

    // ============================================================================
    // Consumer Metrics
    // ============================================================================

    /// Messages received from the broker
    pub static ref CONSUMER_MESSAGES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("actlog_consumer_messages_total", "Total messages consumed"),
        &["consumer_group"]
    ).expect("metric can be created");

    /// Messages skipped because they could not be decoded
    pub static ref DECODE_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("actlog_decode_errors_total", "Total undecodable messages skipped"),
        &["consumer_group"]
    ).expect("metric can be created");

    /// Successful offset commits
    pub static ref COMMITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("actlog_commits_total", "Total offset commits"),
        &["consumer_group"]
    ).expect("metric can be created");

    /// Deliveries rewound for redelivery
    pub static ref REDELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("actlog_redeliveries_total", "Total rewinds after failed persists or commits"),
        &["consumer_group"]
    ).expect("metric can be created");

    /// Consumer errors by type
    pub static ref CONSUMER_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("actlog_consumer_errors_total", "Total consumer errors"),
        &["consumer_group", "error_type"]
    ).expect("metric can be created");

    // ============================================================================
    // Persistence Metrics
    // ============================================================================

    /// Persist calls by outcome (success, failure)
    pub static ref PERSIST_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("actlog_persist_total", "Total persist calls"),
        &["outcome"]
    ).expect("metric can be created");

    /// Records written by successful persists
    pub static ref PERSISTED_RECORDS_TOTAL: IntCounter = IntCounter::new(
        "actlog_persisted_records_total",
        "Total records persisted"
    ).expect("metric can be created");

    /// Persist latency
    pub static ref PERSIST_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new("actlog_persist_latency_seconds", "Persist latency in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
    ).expect("metric can be created");

    // ============================================================================
    // Store Metrics
    // ============================================================================

    /// Read-path queries by kind (get, query, stats)
    pub static ref STORE_QUERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("actlog_store_queries_total", "Total store queries"),
        &["kind"]
    ).expect("metric can be created");

    /// Records removed by retention
    pub static ref RECORDS_EXPIRED_TOTAL: IntCounter = IntCounter::new(
        "actlog_records_expired_total",
        "Total records expired by retention"
    ).expect("metric can be created");

    /// Cache hits
    pub static ref CACHE_HITS_TOTAL: IntCounter = IntCounter::new(
        "actlog_cache_hits_total",
        "Total cache hits"
    ).expect("metric can be created");

    /// Cache misses
    pub static ref CACHE_MISSES_TOTAL: IntCounter = IntCounter::new(
        "actlog_cache_misses_total",
        "Total cache misses"
    ).expect("metric can be created");
}

fn register<C: Collector + Clone + 'static>(metric: &C, name: &str) {
    REGISTRY
        .register(Box::new(metric.clone()))
        .unwrap_or_else(|e| panic!("{} can be registered: {}", name, e));
}

/// Initialize metrics registry
/// Can be called multiple times safely (idempotent)
pub fn init() {
    INIT.call_once(|| {
        // Ingestion metrics
        register(&*RECORDS_INGESTED_TOTAL, "records_ingested_total");
        register(&*BUFFERED_RECORDS, "buffered_records");
        register(&*FLUSHES_TOTAL, "flushes_total");
        register(&*FLUSH_BATCH_SIZE, "flush_batch_size");
        register(&*FLUSH_LATENCY, "flush_latency");
        register(&*PRODUCER_MESSAGES_SENT_TOTAL, "producer_messages_sent_total");
        register(&*PRODUCER_SEND_ERRORS_TOTAL, "producer_send_errors_total");
        register(&*RECORDS_DROPPED_TOTAL, "records_dropped_total");
        register(&*PRODUCER_BYTES_SENT_TOTAL, "producer_bytes_sent_total");
        register(&*QUEUED_FLUSH_BATCHES, "queued_flush_batches");

        // Consumer metrics
        register(&*CONSUMER_MESSAGES_TOTAL, "consumer_messages_total");
        register(&*DECODE_ERRORS_TOTAL, "decode_errors_total");
        register(&*COMMITS_TOTAL, "commits_total");
        register(&*REDELIVERIES_TOTAL, "redeliveries_total");
        register(&*CONSUMER_ERRORS_TOTAL, "consumer_errors_total");

        // Persistence metrics
        register(&*PERSIST_TOTAL, "persist_total");
        register(&*PERSISTED_RECORDS_TOTAL, "persisted_records_total");
        register(&*PERSIST_LATENCY, "persist_latency");

        // Store metrics
        register(&*STORE_QUERIES_TOTAL, "store_queries_total");
        register(&*RECORDS_EXPIRED_TOTAL, "records_expired_total");
        register(&*CACHE_HITS_TOTAL, "cache_hits_total");
        register(&*CACHE_MISSES_TOTAL, "cache_misses_total");
    });
}
