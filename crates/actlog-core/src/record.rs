//! Record Data Structure
//!
//! This module defines the `Record` type, the unit of ingestion. A caller
//! submits a [`LogEntry`]; the ingestion buffer accepts it into a `Record` by
//! assigning an id and the acceptance time. Records are immutable afterwards.
//!
//! ## Structure
//! - **id**: globally unique (UUIDv4), assigned at acceptance
//! - **service / action**: what happened and where
//! - **userId**: optional actor; routes the record when present
//! - **metadata**: optional free-form JSON object
//! - **severity**: `info`, `warn`, `error` or `critical`
//! - **timestamp**: caller supplied, defaults to acceptance time
//! - **createdAt**: acceptance time
//!
//! ## Example
//! ```ignore
//! let entry = LogEntry::new("billing", "invoice.created").with_user("user-42");
//! let record = Record::accept(entry, Utc::now());
//! assert_eq!(record.partition_key().as_str(), "user-42");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::encoder::PartitionKey;

/// Severity of an activity log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

impl Severity {
    /// All severities, in ascending order.
    pub const ALL: [Severity; 4] = [
        Severity::Info,
        Severity::Warn,
        Severity::Error,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warn" => Ok(Severity::Warn),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: '{}'", other)),
        }
    }
}

/// A log write as submitted by a caller, before acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub service: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl LogEntry {
    pub fn new(service: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            action: action.into(),
            user_id: None,
            metadata: None,
            severity: Severity::Info,
            timestamp: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// An accepted activity log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub service: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Record {
    /// Accept an entry at time `now`: assign a fresh id and the acceptance time.
    pub fn accept(entry: LogEntry, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            service: entry.service,
            action: entry.action,
            user_id: entry.user_id,
            metadata: entry.metadata,
            severity: entry.severity,
            timestamp: entry.timestamp.unwrap_or(now),
            created_at: now,
        }
    }

    /// Routing key: `userId` when present, otherwise `service`.
    pub fn partition_key(&self) -> PartitionKey {
        match self.user_id.as_deref() {
            Some(user) if !user.is_empty() => PartitionKey::new(user),
            _ => PartitionKey::new(self.service.as_str()),
        }
    }
}
