//! Actlog Client - Ingestion and Consumption APIs
//!
//! The write path batches activity log records into broker messages; the
//! read path turns broker deliveries back into durable store writes with
//! at-least-once semantics.
//!
//! # Examples
//!
//! ## Ingestion
//!
//! ```ignore
//! use actlog_client::{IngestionBuffer, IngestionConfig};
//!
//! let buffer = IngestionBuffer::new(broker_client, IngestionConfig::default())?;
//! let id = buffer.submit(LogEntry::new("billing", "invoice.created")).await?;
//! buffer.close(Duration::from_secs(5)).await?;
//! ```
//!
//! ## Consumption
//!
//! ```ignore
//! use actlog_client::{BatchConsumer, CommitStrategy, Persister};
//!
//! let consumer = BatchConsumer::builder()
//!     .client(broker_client)
//!     .persister(Persister::new(store))
//!     .group_id("activity-log-consumer")
//!     .strategy(CommitStrategy::PerDelivery)
//!     .build()?;
//!
//! let report = consumer.run(cancel_token).await?;
//! ```

pub mod batch;
pub mod consumer;
pub mod error;
pub mod ingest;
pub mod persister;
pub mod retry;

pub use batch::{FlushTrigger, PendingBatch};
pub use consumer::{
    BatchConsumer, BatchConsumerBuilder, CommitStrategy, ConsumerConfig, ConsumerReport,
    ConsumerStats, DEFAULT_CONSUMER_GROUP,
};
pub use error::{PipelineError, Result};
pub use ingest::{
    FlushReport, IngestionBuffer, IngestionConfig, DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL,
    QUEUE_WARN_DEPTH,
};
pub use persister::Persister;
pub use retry::{retry_until_deadline, retry_with_backoff, RetryPolicy};
