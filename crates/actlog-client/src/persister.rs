//! Persister
//!
//! Bulk-writes decoded records to the [`LogStore`]. It performs no retries:
//! a failure is reported to the consumer, which leaves the delivery
//! uncommitted so the broker redelivers it. A failed call is reported as a
//! whole, even when the store wrote part of the batch; the store's upsert by
//! id makes the retry safe.

use std::sync::Arc;
use std::time::Instant;

use actlog_core::Record;
use actlog_observability::metrics;
use actlog_store::LogStore;
use tracing::{debug, warn};

use crate::error::Result;

#[derive(Clone)]
pub struct Persister {
    store: Arc<dyn LogStore>,
}

impl Persister {
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self { store }
    }

    /// Persist `records` in order. Empty input succeeds without touching the
    /// store.
    pub async fn persist(&self, records: &[Record]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let start = Instant::now();
        let result = self.store.bulk_insert(records).await;
        metrics::PERSIST_LATENCY.observe(start.elapsed().as_secs_f64());

        match result {
            Ok(written) => {
                metrics::PERSIST_TOTAL.with_label_values(&["success"]).inc();
                metrics::PERSISTED_RECORDS_TOTAL.inc_by(written as u64);
                debug!(record_count = records.len(), "Persisted records");
                Ok(written)
            }
            Err(e) => {
                metrics::PERSIST_TOTAL.with_label_values(&["failure"]).inc();
                warn!(record_count = records.len(), error = %e, "Persist failed");
                Err(e.into())
            }
        }
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }
}
