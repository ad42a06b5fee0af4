//! Query and aggregation types for the read path.

use actlog_core::{Record, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const MAX_PAGE_LIMIT: u32 = 100;
/// Stats return at most this many (service, action) groups.
pub const MAX_STATS_GROUPS: usize = 100;

/// Filtered, paginated lookup. Results are sorted by `timestamp`, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogQuery {
    pub service: Option<String>,
    pub action: Option<String>,
    pub user_id: Option<String>,
    pub severity: Option<Severity>,
    /// Inclusive lower bound on `timestamp`.
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `timestamp`.
    pub end: Option<DateTime<Utc>>,
    /// 1-based page number.
    pub page: u32,
    pub limit: u32,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            service: None,
            action: None,
            user_id: None,
            severity: None,
            start: None,
            end: None,
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl LogQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    pub fn page(mut self, page: u32, limit: u32) -> Self {
        self.page = page;
        self.limit = limit;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.page < 1 {
            return Err(StoreError::InvalidQuery("page must be at least 1".to_string()));
        }
        if self.limit < 1 || self.limit > MAX_PAGE_LIMIT {
            return Err(StoreError::InvalidQuery(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_LIMIT
            )));
        }
        check_range(self.start, self.end)
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.service.as_ref().map_or(true, |s| *s == record.service)
            && self.action.as_ref().map_or(true, |a| *a == record.action)
            && self
                .user_id
                .as_ref()
                .map_or(true, |u| record.user_id.as_ref() == Some(u))
            && self.severity.map_or(true, |s| s == record.severity)
            && in_range(record.timestamp, self.start, self.end)
    }

    /// Number of records to skip for the requested page.
    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.limit as usize
    }
}

fn check_range(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Result<()> {
    match (start, end) {
        (Some(start), Some(end)) if start > end => Err(StoreError::InvalidQuery(
            "start must not be after end".to_string(),
        )),
        _ => Ok(()),
    }
}

fn in_range(ts: DateTime<Utc>, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> bool {
    start.map_or(true, |s| ts >= s) && end.map_or(true, |e| ts <= e)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub pages: u64,
}

impl Pagination {
    pub fn new(page: u32, limit: u32, total: u64) -> Self {
        let pages = if limit == 0 {
            0
        } else {
            total.div_ceil(limit as u64)
        };
        Self {
            page,
            limit,
            total,
            pages,
        }
    }
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

/// Filter for [`crate::LogStore::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsFilter {
    pub service: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl StatsFilter {
    pub fn validate(&self) -> Result<()> {
        check_range(self.start, self.end)
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.service.as_ref().map_or(true, |s| *s == record.service)
            && in_range(record.timestamp, self.start, self.end)
    }

    /// Stable cache key, e.g. `stats:billing:-:-`.
    pub fn cache_key(&self) -> String {
        fn part<T: ToString>(value: &Option<T>) -> String {
            value.as_ref().map_or_else(|| "-".to_string(), T::to_string)
        }
        format!(
            "stats:{}:{}:{}",
            part(&self.service),
            part(&self.start.map(|s| s.to_rfc3339())),
            part(&self.end.map(|e| e.to_rfc3339()))
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub info: u64,
    pub warn: u64,
    pub error: u64,
    pub critical: u64,
}

impl SeverityCounts {
    pub fn add(&mut self, severity: Severity) {
        match severity {
            Severity::Info => self.info += 1,
            Severity::Warn => self.warn += 1,
            Severity::Error => self.error += 1,
            Severity::Critical => self.critical += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Record counts for one (service, action) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionStats {
    pub service: String,
    pub action: String,
    pub count: u64,
    pub severity: SeverityCounts,
    pub time_range: TimeRange,
}
