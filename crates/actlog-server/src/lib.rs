//! Activity Log Pipeline Server
//!
//! Runs the whole pipeline in one process:
//! - Ingestion buffer batching log entries into broker messages
//! - Batch consumer persisting deliveries with at-least-once commits
//! - Retention task expiring old records
//! - Shutdown coordinator draining all of it on termination

pub mod config;
pub mod input;
pub mod pipeline;
pub mod shutdown;

pub use config::PipelineConfig;
pub use input::{parse_line, pump_lines, Submission};
pub use pipeline::Pipeline;
pub use shutdown::{wait_for_signal, ShutdownCoordinator, ShutdownReport};
