//! Shutdown Coordinator
//!
//! Drains the pipeline in an order that never loses an accepted record and
//! never commits a partially persisted delivery:
//!
//! ```text
//! 1. health -> not ready
//! 2. ingestion buffer: stop accepting, flush pending batch (bounded by grace)
//! 3. consumer: stop polling
//! 4. consumer: finish the in-flight persist + commit (bounded by grace)
//! 5. release broker and store connections
//! ```
//!
//! A step that fails or times out is recorded in the [`ShutdownReport`]; the
//! remaining steps still run so connections are always released.

use std::sync::Arc;
use std::time::Duration;

use actlog_broker::BrokerClient;
use actlog_client::{ConsumerReport, IngestionBuffer, PipelineError, Result};
use actlog_observability::HealthState;
use actlog_store::LogStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Slack on top of the consumer's own grace period before its task is
/// aborted.
const JOIN_MARGIN: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Records delivered to the broker by the final flush
    pub records_flushed: usize,
    pub flush_timed_out: bool,
    /// Final consumer totals, when the consumer stopped cleanly
    pub consumer: Option<ConsumerReport>,
    /// The in-flight delivery was left uncommitted for redelivery
    pub persist_timed_out: bool,
    pub errors: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        !self.flush_timed_out && !self.persist_timed_out && self.errors.is_empty()
    }
}

/// Everything the coordinator needs to take down a running pipeline.
pub struct ShutdownCoordinator {
    pub(crate) health: HealthState,
    pub(crate) buffer: Arc<IngestionBuffer>,
    pub(crate) cancel: CancellationToken,
    pub(crate) consumer: Option<JoinHandle<Result<ConsumerReport>>>,
    pub(crate) background: Vec<JoinHandle<()>>,
    pub(crate) producer: Arc<dyn BrokerClient>,
    pub(crate) consumer_client: Arc<dyn BrokerClient>,
    pub(crate) store: Arc<dyn LogStore>,
    pub(crate) grace: Duration,
}

impl ShutdownCoordinator {
    pub async fn run(mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        info!(grace_ms = self.grace.as_millis() as u64, "Shutting down pipeline");

        self.health.set_ready(false);

        // Steps 1-2: producer side.
        match self.buffer.close(self.grace).await {
            Ok(flush) => report.records_flushed = flush.records,
            Err(PipelineError::ShutdownTimeout(_)) => {
                warn!("Final producer flush did not finish within the grace period");
                report.flush_timed_out = true;
            }
            Err(e) => {
                error!(error = %e, "Final producer flush failed");
                report.errors.push(format!("flush: {}", e));
            }
        }

        // Steps 3-4: consumer side. The consumer bounds its own in-flight
        // persist by the grace period; the join timeout only guards a hung task.
        self.cancel.cancel();
        if let Some(mut handle) = self.consumer.take() {
            match tokio::time::timeout(self.grace + JOIN_MARGIN, &mut handle).await {
                Ok(Ok(Ok(consumer))) => report.consumer = Some(consumer),
                Ok(Ok(Err(PipelineError::ShutdownTimeout(_)))) => {
                    report.persist_timed_out = true;
                }
                Ok(Ok(Err(e))) => {
                    error!(error = %e, "Consumer stopped with error");
                    report.errors.push(format!("consumer: {}", e));
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Consumer task panicked");
                    report.errors.push(format!("consumer task: {}", e));
                }
                Err(_) => {
                    warn!("Consumer did not stop in time, aborting");
                    handle.abort();
                    report.persist_timed_out = true;
                }
            }
        }
        for task in self.background.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        // Step 5: release connections.
        if let Err(e) = self.producer.close().await {
            report.errors.push(format!("producer close: {}", e));
        }
        if let Err(e) = self.consumer_client.close().await {
            report.errors.push(format!("consumer close: {}", e));
        }
        if let Err(e) = self.store.close().await {
            report.errors.push(format!("store close: {}", e));
        }

        info!(
            records_flushed = report.records_flushed,
            flush_timed_out = report.flush_timed_out,
            persist_timed_out = report.persist_timed_out,
            errors = report.errors.len(),
            "Pipeline shut down"
        );
        report
    }
}

/// Resolve on SIGINT or SIGTERM, returning the signal name.
pub async fn wait_for_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
