//! Activity Log Pipeline
//!
//! Runs producer, consumer, an in-memory broker and an in-memory store in
//! one process.
//!
//! ## Input
//! Log entries are read from stdin as JSON lines. A line holding an array is
//! submitted as one batch. The id of every accepted record is printed to
//! stdout, one per line.
//!
//! ```bash
//! echo '{"service":"auth","action":"login","userId":"u1"}' | cargo run -p actlog-server
//! ```
//!
//! ## Configuration
//! All configuration is done via `ACTLOG_*` environment variables; see
//! `actlog_server::config`. Metrics and health are served on
//! `ACTLOG_METRICS_ADDR` (`/metrics`, `/health`).
//!
//! ## Shutdown
//! SIGINT, SIGTERM or end of input drain the pipeline through the shutdown
//! coordinator. The exit code is non-zero if startup failed or the drain was
//! not clean.
//!
//! ## Logging
//! ```bash
//! RUST_LOG=debug cargo run -p actlog-server    # Detailed logs
//! RUST_LOG=info cargo run -p actlog-server     # Standard logs (default)
//! ```

use std::sync::Arc;

use actlog_broker::InMemoryBroker;
use actlog_observability::{exporter, metrics};
use actlog_server::{pump_lines, wait_for_signal, Pipeline, PipelineConfig};
use actlog_store::InMemoryLogStore;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries accepted ids.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = PipelineConfig::from_env()?;
    metrics::init();

    let broker = InMemoryBroker::new(config.topic.clone(), config.partitions);
    let store = Arc::new(InMemoryLogStore::new());
    let pipeline = Pipeline::start(
        config.clone(),
        Arc::new(broker.client("producer")),
        Arc::new(broker.client(config.consumer_group.clone())),
        store,
    )
    .await?;

    // Metrics + health endpoint
    let listener = tokio::net::TcpListener::bind(config.metrics_addr).await?;
    tracing::info!("Metrics server listening on {}", listener.local_addr()?);
    let http_shutdown = CancellationToken::new();
    let http = {
        let router = exporter::create_router(pipeline.health());
        let stop = http_shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(stop.cancelled_owned())
                .await
        })
    };

    let buffer = pipeline.buffer().clone();
    let input = pump_lines(BufReader::new(tokio::io::stdin()), &buffer, |id| {
        println!("{}", id);
    });

    tokio::select! {
        result = input => {
            let accepted = result?;
            tracing::info!(accepted, "End of input, initiating graceful shutdown");
        }
        signal = wait_for_signal() => {
            tracing::info!(signal, "Received signal, initiating graceful shutdown");
        }
    }

    let report = pipeline.shutdown().await;
    http_shutdown.cancel();
    if let Ok(Err(e)) = http.await {
        tracing::error!("Metrics server error: {}", e);
    }

    if !report.is_clean() {
        tracing::error!(
            flush_timed_out = report.flush_timed_out,
            persist_timed_out = report.persist_timed_out,
            errors = ?report.errors,
            "Shutdown was not clean"
        );
    } else {
        tracing::info!("Activity log pipeline shut down gracefully");
    }

    // A blocking stdin read cannot be cancelled, so exit instead of waiting
    // for the runtime to drop.
    std::process::exit(if report.is_clean() { 0 } else { 1 });
}
