//! Read-Through Caching Layer
//!
//! Wraps a [`LogStore`] with a [`QueryCache`] on the read path.
//!
//! ## What Gets Cached?
//!
//! | Read | Key | TTL |
//! |------|-----|-----|
//! | `get` | `log:{id}` | 10 minutes |
//! | `query` | `logs:{query as JSON}` | 5 minutes |
//! | `stats` | `stats:{service}:{start}:{end}` | 10 minutes |
//!
//! Missing records are not cached, so a record that lands after a lookup is
//! visible on the next `get`.
//!
//! ## Invalidation
//!
//! `bulk_insert` writes through and then drops `log:{id}` for every inserted
//! record. Query pages and stats are left to expire by TTL: they are
//! aggregate views that tolerate a few minutes of staleness.
//!
//! A failing cache never fails a read. Errors are logged and the read falls
//! through to the store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use actlog_core::Record;
use actlog_observability::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::QueryCache;
use crate::error::Result;
use crate::store::LogStore;
use crate::types::{ActionStats, LogQuery, Page, StatsFilter};

/// TTLs for each cached read
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub record_ttl: Duration,
    pub query_ttl: Duration,
    pub stats_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            record_ttl: Duration::from_secs(600),
            query_ttl: Duration::from_secs(300),
            stats_ttl: Duration::from_secs(600),
        }
    }
}

/// Cache performance counters for this wrapper
#[derive(Debug, Clone, Default)]
pub struct CacheMetrics {
    pub hits: Arc<AtomicU64>,
    pub misses: Arc<AtomicU64>,
}

impl CacheMetrics {
    /// Hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::CACHE_HITS_TOTAL.inc();
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::CACHE_MISSES_TOTAL.inc();
    }
}

pub fn record_key(id: &str) -> String {
    format!("log:{}", id)
}

pub fn query_key(query: &LogQuery) -> Result<String> {
    Ok(format!("logs:{}", serde_json::to_string(query)?))
}

pub struct CachedLogStore {
    inner: Arc<dyn LogStore>,
    cache: Arc<dyn QueryCache>,
    config: CacheConfig,
    metrics: CacheMetrics,
}

impl CachedLogStore {
    pub fn new(inner: Arc<dyn LogStore>, cache: Arc<dyn QueryCache>) -> Self {
        Self::with_config(inner, cache, CacheConfig::default())
    }

    pub fn with_config(
        inner: Arc<dyn LogStore>,
        cache: Arc<dyn QueryCache>,
        config: CacheConfig,
    ) -> Self {
        Self {
            inner,
            cache,
            config,
            metrics: CacheMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    async fn cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.cache.get(key).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "Cache read failed");
                None
            }
        };
        match raw.map(|raw| serde_json::from_str(&raw)) {
            Some(Ok(value)) => {
                self.metrics.hit();
                Some(value)
            }
            Some(Err(e)) => {
                warn!(key, error = %e, "Discarding undecodable cache entry");
                self.invalidate(key).await;
                self.metrics.miss();
                None
            }
            None => {
                self.metrics.miss();
                None
            }
        }
    }

    async fn store<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(key, error = %e, "Cannot encode value for cache");
                return;
            }
        };
        if let Err(e) = self.cache.set(key, encoded, ttl).await {
            warn!(key, error = %e, "Cache write failed");
        }
    }

    async fn invalidate(&self, key: &str) {
        if let Err(e) = self.cache.delete(key).await {
            warn!(key, error = %e, "Cache delete failed");
        }
    }
}

#[async_trait]
impl LogStore for CachedLogStore {
    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn bulk_insert(&self, records: &[Record]) -> Result<usize> {
        let written = self.inner.bulk_insert(records).await?;
        for record in records {
            self.invalidate(&record_key(&record.id)).await;
        }
        Ok(written)
    }

    async fn get(&self, id: &str) -> Result<Option<Record>> {
        let key = record_key(id);
        if let Some(record) = self.cached::<Record>(&key).await {
            return Ok(Some(record));
        }

        let record = self.inner.get(id).await?;
        if let Some(ref r) = record {
            self.store(&key, r, self.config.record_ttl).await;
        }
        Ok(record)
    }

    async fn query(&self, query: &LogQuery) -> Result<Page<Record>> {
        query.validate()?;
        let key = query_key(query)?;
        if let Some(page) = self.cached::<Page<Record>>(&key).await {
            debug!(key = %key, "Returning cached results");
            return Ok(page);
        }

        let page = self.inner.query(query).await?;
        self.store(&key, &page, self.config.query_ttl).await;
        Ok(page)
    }

    async fn stats(&self, filter: &StatsFilter) -> Result<Vec<ActionStats>> {
        let key = filter.cache_key();
        if let Some(stats) = self.cached::<Vec<ActionStats>>(&key).await {
            return Ok(stats);
        }

        let stats = self.inner.stats(filter).await?;
        self.store(&key, &stats, self.config.stats_ttl).await;
        Ok(stats)
    }

    async fn expire_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.inner.expire_before(cutoff).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
