//! Activity Log Observability
//!
//! Prometheus metrics for every pipeline stage and the HTTP surface that
//! exposes them.
//!
//! # Usage
//!
//! ```no_run
//! use actlog_observability::{exporter, metrics, HealthState};
//!
//! metrics::init();
//!
//! let health = HealthState::new();
//! let router = exporter::create_router(health.clone());
//! health.set_ready(true);
//! ```

pub mod exporter;
pub mod metrics;

pub use exporter::HealthState;
pub use metrics::{init as init_metrics, REGISTRY};
