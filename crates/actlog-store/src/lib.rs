//! Durable store and query cache for activity log records.
//!
//! - [`LogStore`]: idempotent bulk writes, id lookup, filtered pages, stats
//!   and retention
//! - [`InMemoryLogStore`]: upsert-by-id store with fault injection
//! - [`QueryCache`] / [`InMemoryCache`]: TTL key/value cache for the read path
//! - [`CachedLogStore`]: read-through wrapper combining the two
//! - [`RetentionTask`]: periodic expiry of old records

pub mod cache;
pub mod cached_store;
pub mod error;
pub mod memory;
pub mod retention;
pub mod store;
pub mod types;

pub use cache::{InMemoryCache, QueryCache};
pub use cached_store::{CacheConfig, CacheMetrics, CachedLogStore};
pub use error::{Result, StoreError};
pub use memory::InMemoryLogStore;
pub use retention::RetentionTask;
pub use store::LogStore;
pub use types::{
    ActionStats, LogQuery, Page, Pagination, SeverityCounts, StatsFilter, TimeRange,
};
