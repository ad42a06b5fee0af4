//! Pipeline wiring
//!
//! Connects broker and store (with a startup deadline), then starts the
//! ingestion buffer, the batch consumer and the retention task on the
//! current runtime.

use std::sync::Arc;

use actlog_broker::BrokerClient;
use actlog_client::{
    retry_until_deadline, BatchConsumer, IngestionBuffer, Persister, PipelineError, Result,
    RetryPolicy,
};
use actlog_observability::HealthState;
use actlog_store::retention::DEFAULT_RETENTION_INTERVAL;
use actlog_store::{CachedLogStore, InMemoryCache, LogStore, RetentionTask};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::PipelineConfig;
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};

pub struct Pipeline {
    config: PipelineConfig,
    health: HealthState,
    buffer: Arc<IngestionBuffer>,
    reader: Arc<dyn LogStore>,
    coordinator: ShutdownCoordinator,
}

impl Pipeline {
    /// Connect and start every stage.
    ///
    /// Fails with [`PipelineError::FatalConnection`] when the broker or the
    /// store is still unreachable after `connect_deadline`; nothing is left
    /// running in that case.
    pub async fn start(
        config: PipelineConfig,
        producer: Arc<dyn BrokerClient>,
        consumer_client: Arc<dyn BrokerClient>,
        store: Arc<dyn LogStore>,
    ) -> Result<Self> {
        config.validate()?;
        let deadline = Instant::now() + config.connect_deadline;
        let probe = RetryPolicy::default();

        retry_until_deadline(&probe, deadline, || producer.connect())
            .await
            .map_err(|e| PipelineError::FatalConnection(format!("broker (producer): {}", e)))?;
        retry_until_deadline(&probe, deadline, || consumer_client.connect())
            .await
            .map_err(|e| PipelineError::FatalConnection(format!("broker (consumer): {}", e)))?;
        retry_until_deadline(&probe, deadline, || store.ping())
            .await
            .map_err(|e| PipelineError::FatalConnection(format!("store: {}", e)))?;
        info!("Broker and store connected");

        let buffer = Arc::new(IngestionBuffer::new(producer.clone(), config.ingestion())?);

        let consumer = BatchConsumer::builder()
            .client(consumer_client.clone())
            .persister(Persister::new(store.clone()))
            .config(config.consumer())
            .build()?;

        let cancel = CancellationToken::new();
        let consumer = consumer.spawn(cancel.clone());
        let retention = RetentionTask::new(
            store.clone(),
            config.retention_days,
            DEFAULT_RETENTION_INTERVAL,
        )
        .spawn(cancel.clone());

        let reader: Arc<dyn LogStore> = Arc::new(CachedLogStore::new(
            store.clone(),
            Arc::new(InMemoryCache::default()),
        ));

        let health = HealthState::new();
        health.set_ready(true);
        info!(
            topic = %config.topic,
            consumer_group = %config.consumer_group,
            strategy = %config.commit_strategy,
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            "Pipeline started"
        );

        Ok(Self {
            coordinator: ShutdownCoordinator {
                health: health.clone(),
                buffer: buffer.clone(),
                cancel,
                consumer: Some(consumer),
                background: vec![retention],
                producer,
                consumer_client,
                store,
                grace: config.shutdown_grace,
            },
            config,
            health,
            buffer,
            reader,
        })
    }

    /// Where callers submit log entries.
    pub fn buffer(&self) -> &Arc<IngestionBuffer> {
        &self.buffer
    }

    /// Cached read path over the store.
    pub fn reader(&self) -> &Arc<dyn LogStore> {
        &self.reader
    }

    pub fn health(&self) -> HealthState {
        self.health.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Drain and stop everything. See [`ShutdownCoordinator`].
    pub async fn shutdown(self) -> ShutdownReport {
        self.coordinator.run().await
    }
}
