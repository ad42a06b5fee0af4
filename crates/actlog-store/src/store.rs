//! Log Store Trait
//!
//! The durable store the consumer persists into and the read path queries.
//!
//! ## Write Contract
//!
//! `bulk_insert` is an upsert by record id. Applying the same records twice
//! leaves the store exactly as applying them once, which is what makes
//! at-least-once delivery safe: a redelivered batch overwrites itself.
//!
//! On `Ok` every record is visible to subsequent reads. On `Err` callers must
//! assume nothing was written, even if the backend wrote part of the batch.
//!
//! ## Read Contract
//!
//! - `get`: lookup by id
//! - `query`: filtered pages, newest `timestamp` first
//! - `stats`: counts per (service, action), largest first, at most 100 groups
//!
//! ## Retention
//!
//! `expire_before` deletes records whose `created_at` is older than the
//! cutoff. [`crate::RetentionTask`] calls it periodically.

use actlog_core::Record;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{ActionStats, LogQuery, Page, StatsFilter};

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Check the store is reachable.
    async fn ping(&self) -> Result<()>;

    /// Upsert `records` by id. Returns how many records were written.
    async fn bulk_insert(&self, records: &[Record]) -> Result<usize>;

    async fn get(&self, id: &str) -> Result<Option<Record>>;

    async fn query(&self, query: &LogQuery) -> Result<Page<Record>>;

    async fn stats(&self, filter: &StatsFilter) -> Result<Vec<ActionStats>>;

    /// Delete records created before `cutoff`. Returns how many were removed.
    async fn expire_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Release the store connection.
    async fn close(&self) -> Result<()>;
}
