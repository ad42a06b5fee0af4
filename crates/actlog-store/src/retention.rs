//! Retention Task - Record Expiry
//!
//! Runs in the background and periodically deletes records whose
//! `createdAt` is older than the configured age (90 days by default).
//!
//! ## How It Works
//!
//! 1. Every `interval` (hourly by default), compute `now - max_age`. An age
//!    that cannot be represented is an error, not a panic
//! 2. Call `expire_before(cutoff)` on the store
//! 3. If the call fails, log and try again next tick
//! 4. Stop when the cancellation token fires

use std::sync::Arc;
use std::time::Duration;

use actlog_observability::metrics;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Result, StoreError};
use crate::store::LogStore;

pub const DEFAULT_RETENTION_DAYS: u32 = 90;
pub const DEFAULT_RETENTION_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Upper bound accepted by configuration (100 years).
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Background task that expires old records
pub struct RetentionTask {
    store: Arc<dyn LogStore>,
    retention_days: u32,
    interval: Duration,
}

impl RetentionTask {
    pub fn new(store: Arc<dyn LogStore>, retention_days: u32, interval: Duration) -> Self {
        Self {
            store,
            retention_days,
            interval,
        }
    }

    /// Oldest `createdAt` that survives a pass at `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        chrono::Duration::try_days(self.retention_days as i64)
            .and_then(|max_age| now.checked_sub_signed(max_age))
            .ok_or_else(|| {
                StoreError::InvalidQuery(format!(
                    "retention of {} days is out of range",
                    self.retention_days
                ))
            })
    }

    /// Expire everything older than the retention age once.
    pub async fn run_once(&self) -> Result<u64> {
        let cutoff = self.cutoff(Utc::now())?;
        let removed = self.store.expire_before(cutoff).await?;
        metrics::RECORDS_EXPIRED_TOTAL.inc_by(removed);
        Ok(removed)
    }

    /// Run the retention loop (blocks until cancelled)
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            max_age_days = self.retention_days,
            interval_seconds = self.interval.as_secs(),
            "Retention task started"
        );

        let mut passes: u64 = 0;
        let mut expired: u64 = 0;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = cancel.cancelled() => break,
            }

            match self.run_once().await {
                Ok(removed) => {
                    passes += 1;
                    expired += removed;
                    debug!(removed, "Retention pass complete");
                }
                Err(e) => {
                    error!(error = %e, "Retention pass failed");
                }
            }
        }

        info!(
            total_passes = passes,
            total_expired = expired,
            "Retention task stopped"
        );
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
