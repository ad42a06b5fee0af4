//! In-memory [`LogStore`] keyed by record id.
//!
//! Besides backing the binary and the tests, it carries the fault injection
//! the pipeline tests rely on: an unavailable switch, failing the next N
//! inserts (optionally after writing part of the batch), and a per-insert
//! delay for exercising shutdown grace periods.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use actlog_core::Record;
use actlog_observability::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::store::LogStore;
use crate::types::{
    ActionStats, LogQuery, Page, Pagination, SeverityCounts, StatsFilter, TimeRange,
    MAX_STATS_GROUPS,
};

#[derive(Default)]
pub struct InMemoryLogStore {
    records: RwLock<HashMap<String, Record>>,
    unavailable: AtomicBool,
    closed: AtomicBool,
    fail_inserts: AtomicUsize,
    partial_writes: AtomicBool,
    insert_delay: StdMutex<Option<Duration>>,
    insert_calls: AtomicU64,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` calls to `bulk_insert`.
    pub fn fail_next_inserts(&self, n: usize) {
        self.fail_inserts.store(n, Ordering::SeqCst);
    }

    /// When set, an injected insert failure first writes the leading half of
    /// the batch, like a backend that dies mid-write.
    pub fn set_partial_writes(&self, partial: bool) {
        self.partial_writes.store(partial, Ordering::SeqCst);
    }

    /// Delay every `bulk_insert` by `delay`.
    pub fn set_insert_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.insert_delay.lock() {
            *slot = delay;
        }
    }

    /// Number of `bulk_insert` calls, failed ones included.
    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Every stored record, oldest `timestamp` first.
    pub async fn all(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        records
    }

    fn check_available(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is not reachable".to_string()));
        }
        Ok(())
    }

    fn take_insert_fault(&self) -> bool {
        self.fail_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn insert_delay(&self) -> Option<Duration> {
        self.insert_delay.lock().ok().and_then(|slot| *slot)
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    async fn bulk_insert(&self, records: &[Record]) -> Result<usize> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.insert_delay() {
            tokio::time::sleep(delay).await;
        }
        self.check_available()?;

        if self.take_insert_fault() {
            if self.partial_writes.load(Ordering::SeqCst) {
                let mut stored = self.records.write().await;
                for record in &records[..records.len() / 2] {
                    stored.insert(record.id.clone(), record.clone());
                }
            }
            return Err(StoreError::WriteRejected("injected insert failure".to_string()));
        }

        let mut stored = self.records.write().await;
        for record in records {
            stored.insert(record.id.clone(), record.clone());
        }
        debug!(count = records.len(), total = stored.len(), "Inserted records");
        Ok(records.len())
    }

    async fn get(&self, id: &str) -> Result<Option<Record>> {
        self.check_available()?;
        metrics::STORE_QUERIES_TOTAL.with_label_values(&["get"]).inc();
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn query(&self, query: &LogQuery) -> Result<Page<Record>> {
        query.validate()?;
        self.check_available()?;
        metrics::STORE_QUERIES_TOTAL.with_label_values(&["query"]).inc();

        let stored = self.records.read().await;
        let mut matching: Vec<&Record> = stored.values().filter(|r| query.matches(r)).collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));

        let total = matching.len() as u64;
        let data = matching
            .into_iter()
            .skip(query.offset())
            .take(query.limit as usize)
            .cloned()
            .collect();

        Ok(Page {
            data,
            pagination: Pagination::new(query.page, query.limit, total),
        })
    }

    async fn stats(&self, filter: &StatsFilter) -> Result<Vec<ActionStats>> {
        filter.validate()?;
        self.check_available()?;
        metrics::STORE_QUERIES_TOTAL.with_label_values(&["stats"]).inc();

        let stored = self.records.read().await;
        let mut groups: HashMap<(&str, &str), (u64, SeverityCounts)> = HashMap::new();
        for record in stored.values().filter(|r| filter.matches(r)) {
            let group = groups
                .entry((record.service.as_str(), record.action.as_str()))
                .or_default();
            group.0 += 1;
            group.1.add(record.severity);
        }

        let time_range = TimeRange {
            start: filter.start.unwrap_or_default(),
            end: filter.end.unwrap_or_else(Utc::now),
        };
        let mut stats: Vec<ActionStats> = groups
            .into_iter()
            .map(|((service, action), (count, severity))| ActionStats {
                service: service.to_string(),
                action: action.to_string(),
                count,
                severity,
                time_range,
            })
            .collect();
        stats.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.service.cmp(&b.service))
                .then_with(|| a.action.cmp(&b.action))
        });
        stats.truncate(MAX_STATS_GROUPS);
        Ok(stats)
    }

    async fn expire_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check_available()?;
        let mut stored = self.records.write().await;
        let before = stored.len();
        stored.retain(|_, record| record.created_at >= cutoff);
        let removed = (before - stored.len()) as u64;
        if removed > 0 {
            info!(removed, cutoff = %cutoff, "Expired records");
        }
        Ok(removed)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actlog_core::{LogEntry, Severity};
    use chrono::Duration as ChronoDuration;

    fn record(service: &str, action: &str, severity: Severity, minutes_ago: i64) -> Record {
        let ts = Utc::now() - ChronoDuration::minutes(minutes_ago);
        let entry = LogEntry::new(service, action)
            .with_severity(severity)
            .with_timestamp(ts);
        Record::accept(entry, ts)
    }

    #[tokio::test]
    async fn test_bulk_insert_is_idempotent() {
        let store = InMemoryLogStore::new();
        let records = vec![
            record("auth", "login", Severity::Info, 3),
            record("auth", "logout", Severity::Info, 2),
        ];

        assert_eq!(store.bulk_insert(&records).await.unwrap(), 2);
        let once = store.all().await;
        store.bulk_insert(&records).await.unwrap();
        assert_eq!(store.all().await, once);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_injected_failure_with_partial_write() {
        let store = InMemoryLogStore::new();
        store.fail_next_inserts(1);
        store.set_partial_writes(true);
        let records: Vec<_> = (0..4)
            .map(|i| record("svc", "act", Severity::Info, i))
            .collect();

        assert!(store.bulk_insert(&records).await.is_err());
        assert_eq!(store.len().await, 2);

        // Retrying the whole batch converges.
        store.bulk_insert(&records).await.unwrap();
        assert_eq!(store.len().await, 4);
        assert_eq!(store.insert_calls(), 2);
    }

    #[tokio::test]
    async fn test_query_sorted_and_paginated() {
        let store = InMemoryLogStore::new();
        let records: Vec<_> = (0..5)
            .map(|i| record("auth", "login", Severity::Info, i))
            .collect();
        store.bulk_insert(&records).await.unwrap();

        let page = store.query(&LogQuery::new().page(1, 2)).await.unwrap();
        assert_eq!(page.pagination.total, 5);
        assert_eq!(page.pagination.pages, 3);
        // Newest first: 0 minutes ago, then 1 minute ago.
        assert_eq!(page.data[0].id, records[0].id);
        assert_eq!(page.data[1].id, records[1].id);

        let last = store.query(&LogQuery::new().page(3, 2)).await.unwrap();
        assert_eq!(last.data.len(), 1);
        assert_eq!(last.data[0].id, records[4].id);

        assert!(store.query(&LogQuery::new().page(1, 500)).await.is_err());
    }

    #[tokio::test]
    async fn test_stats_grouping() {
        let store = InMemoryLogStore::new();
        store
            .bulk_insert(&[
                record("auth", "login", Severity::Info, 1),
                record("auth", "login", Severity::Error, 1),
                record("auth", "login", Severity::Error, 1),
                record("auth", "logout", Severity::Warn, 1),
                record("billing", "charge", Severity::Critical, 1),
            ])
            .await
            .unwrap();

        let stats = store.stats(&StatsFilter::default()).await.unwrap();
        assert_eq!(stats.len(), 3);
        assert_eq!(stats[0].service, "auth");
        assert_eq!(stats[0].action, "login");
        assert_eq!(stats[0].count, 3);
        assert_eq!(stats[0].severity.error, 2);
        assert_eq!(stats[0].severity.info, 1);

        let billing = StatsFilter {
            service: Some("billing".to_string()),
            ..Default::default()
        };
        let stats = store.stats(&billing).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].severity.critical, 1);
    }

    #[tokio::test]
    async fn test_expire_before_uses_created_at() {
        let store = InMemoryLogStore::new();
        let old = record("auth", "login", Severity::Info, 60 * 24 * 100);
        let fresh = record("auth", "login", Severity::Info, 5);
        store.bulk_insert(&[old.clone(), fresh.clone()]).await.unwrap();

        let removed = store
            .expire_before(Utc::now() - ChronoDuration::days(90))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(&old.id).await.unwrap().is_none());
        assert!(store.get(&fresh.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unavailable_and_closed() {
        let store = InMemoryLogStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.ping().await, Err(StoreError::Unavailable(_))));
        store.set_unavailable(false);
        store.ping().await.unwrap();

        store.close().await.unwrap();
        assert!(matches!(store.ping().await, Err(StoreError::Closed)));
    }
}
