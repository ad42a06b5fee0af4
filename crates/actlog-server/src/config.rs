//! Pipeline configuration
//!
//! Everything is read from `ACTLOG_*` environment variables:
//!
//! - `ACTLOG_TOPIC`: broker topic (default: activity-logs)
//! - `ACTLOG_PARTITIONS`: partition count (default: 3)
//! - `ACTLOG_CONSUMER_GROUP`: consumer group (default: activity-log-consumer)
//! - `ACTLOG_BATCH_SIZE`: size trigger for producer and local consumer batches (default: 100)
//! - `ACTLOG_FLUSH_INTERVAL_MS`: time trigger (default: 1000)
//! - `ACTLOG_COMMIT_STRATEGY`: `per-delivery` or `local-batch` (default: per-delivery)
//! - `ACTLOG_MAX_POLL_RECORDS`: messages per delivery (default: 500)
//! - `ACTLOG_POLL_TIMEOUT_MS`: poll wait (default: 500)
//! - `ACTLOG_HEARTBEAT_INTERVAL_MS`: consumer heartbeat (default: 3000)
//! - `ACTLOG_SEND_RETRIES`: producer send retries (default: 3)
//! - `ACTLOG_CONNECT_DEADLINE_MS`: startup connection deadline (default: 10000)
//! - `ACTLOG_SHUTDOWN_GRACE_MS`: shutdown grace period (default: 5000)
//! - `ACTLOG_RETENTION_DAYS`: record retention, at most 36500 (default: 90)
//! - `ACTLOG_METRICS_ADDR`: metrics and health listener (default: 0.0.0.0:9464)

use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use actlog_client::{
    CommitStrategy, ConsumerConfig, IngestionConfig, PipelineError, Result, RetryPolicy,
    DEFAULT_CONSUMER_GROUP,
};
use actlog_store::retention::MAX_RETENTION_DAYS;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub topic: String,
    pub partitions: u32,
    pub consumer_group: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub commit_strategy: CommitStrategy,
    pub max_poll_records: usize,
    pub poll_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub send_retries: usize,
    pub connect_deadline: Duration,
    pub shutdown_grace: Duration,
    pub retention_days: u32,
    pub metrics_addr: SocketAddr,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            topic: "activity-logs".to_string(),
            partitions: 3,
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            batch_size: 100,
            flush_interval: Duration::from_millis(1000),
            commit_strategy: CommitStrategy::PerDelivery,
            max_poll_records: 500,
            poll_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(3000),
            send_retries: 3,
            connect_deadline: Duration::from_millis(10_000),
            shutdown_grace: Duration::from_millis(5000),
            retention_days: 90,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9464)),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            topic: lookup("ACTLOG_TOPIC").unwrap_or(defaults.topic),
            partitions: parse(&lookup, "ACTLOG_PARTITIONS", defaults.partitions)?,
            consumer_group: lookup("ACTLOG_CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            batch_size: parse(&lookup, "ACTLOG_BATCH_SIZE", defaults.batch_size)?,
            flush_interval: parse_ms(&lookup, "ACTLOG_FLUSH_INTERVAL_MS", defaults.flush_interval)?,
            commit_strategy: parse(&lookup, "ACTLOG_COMMIT_STRATEGY", defaults.commit_strategy)?,
            max_poll_records: parse(&lookup, "ACTLOG_MAX_POLL_RECORDS", defaults.max_poll_records)?,
            poll_timeout: parse_ms(&lookup, "ACTLOG_POLL_TIMEOUT_MS", defaults.poll_timeout)?,
            heartbeat_interval: parse_ms(
                &lookup,
                "ACTLOG_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval,
            )?,
            send_retries: parse(&lookup, "ACTLOG_SEND_RETRIES", defaults.send_retries)?,
            connect_deadline: parse_ms(
                &lookup,
                "ACTLOG_CONNECT_DEADLINE_MS",
                defaults.connect_deadline,
            )?,
            shutdown_grace: parse_ms(&lookup, "ACTLOG_SHUTDOWN_GRACE_MS", defaults.shutdown_grace)?,
            retention_days: parse(&lookup, "ACTLOG_RETENTION_DAYS", defaults.retention_days)?,
            metrics_addr: parse(&lookup, "ACTLOG_METRICS_ADDR", defaults.metrics_addr)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("ACTLOG_PARTITIONS", self.partitions as u64),
            ("ACTLOG_BATCH_SIZE", self.batch_size as u64),
            ("ACTLOG_FLUSH_INTERVAL_MS", self.flush_interval.as_millis() as u64),
            ("ACTLOG_MAX_POLL_RECORDS", self.max_poll_records as u64),
            ("ACTLOG_HEARTBEAT_INTERVAL_MS", self.heartbeat_interval.as_millis() as u64),
            ("ACTLOG_RETENTION_DAYS", self.retention_days as u64),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(PipelineError::Config(format!("{} must be greater than zero", key)));
            }
        }
        if self.retention_days > MAX_RETENTION_DAYS {
            return Err(PipelineError::Config(format!(
                "ACTLOG_RETENTION_DAYS must be at most {}",
                MAX_RETENTION_DAYS
            )));
        }
        if self.topic.is_empty() || self.consumer_group.is_empty() {
            return Err(PipelineError::Config(
                "topic and consumer group must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn ingestion(&self) -> IngestionConfig {
        IngestionConfig {
            batch_size: self.batch_size,
            flush_interval: self.flush_interval,
            send_retry: RetryPolicy::with_max_retries(self.send_retries),
        }
    }

    pub fn consumer(&self) -> ConsumerConfig {
        ConsumerConfig {
            group_id: self.consumer_group.clone(),
            strategy: self.commit_strategy,
            max_poll_records: self.max_poll_records,
            poll_timeout: self.poll_timeout,
            heartbeat_interval: self.heartbeat_interval,
            batch_size: self.batch_size,
            flush_interval: self.flush_interval,
            shutdown_grace: self.shutdown_grace,
            retry_backoff: RetryPolicy::default(),
        }
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| PipelineError::Config(format!("invalid {}='{}': {}", key, raw, e))),
        None => Ok(default),
    }
}

fn parse_ms<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let ms = parse(lookup, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}
