//! Error types for the activity log pipeline.
//!
//! ## Error Handling Strategy
//!
//! - **Transient**: `TransientBroker`, `TransientStore`. Never retried inside
//!   a single call; the producer's flush worker retries sends a bounded number
//!   of times, the consumer turns store failures into redelivery. A wrapped
//!   error that cannot succeed later (`Closed`, invalid marker) is not
//!   transient.
//! - **Per-message**: `Decode`. The message is skipped and its marker still
//!   advances.
//! - **Startup**: `FatalConnection`. The process must not start serving.
//! - **Shutdown**: `ShutdownTimeout`, `ShuttingDown`.
//! - **Local**: `Config`, `Internal`.

use std::time::Duration;

use actlog_broker::BrokerError;
use actlog_store::StoreError;
use thiserror::Error;

/// Convenience type alias for `Result<T, PipelineError>`.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A send, poll, heartbeat or commit against the broker failed.
    #[error("Broker error: {0}")]
    TransientBroker(#[from] BrokerError),

    /// A write or read against the store failed. A failed persist leaves the
    /// delivery uncommitted so the broker redelivers it.
    #[error("Store error: {0}")]
    TransientStore(#[from] StoreError),

    /// A consumed message could not be decoded into a record.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Broker or store still unreachable when the startup deadline passed.
    #[error("Connection failed: {0}")]
    FatalConnection(String),

    /// An in-flight persist or flush did not finish within the grace period.
    /// Nothing was committed for it.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// Submission attempted after shutdown began.
    #[error("Pipeline is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<actlog_core::Error> for PipelineError {
    fn from(err: actlog_core::Error) -> Self {
        match err {
            actlog_core::Error::Decode(msg) => PipelineError::Decode(msg),
            actlog_core::Error::Encode(msg) => {
                PipelineError::Internal(format!("record encoding failed: {}", msg))
            }
        }
    }
}

impl PipelineError {
    /// Whether a later attempt at the same operation can succeed. The
    /// consumer only redelivers on transient errors.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::TransientBroker(e) => e.is_retryable(),
            PipelineError::TransientStore(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Short label used for the `error_type` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::TransientBroker(_) => "broker",
            PipelineError::TransientStore(_) => "store",
            PipelineError::Decode(_) => "decode",
            PipelineError::FatalConnection(_) => "fatal_connection",
            PipelineError::ShutdownTimeout(_) => "shutdown_timeout",
            PipelineError::ShuttingDown => "shutting_down",
            PipelineError::Config(_) => "config",
            PipelineError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_lower_level_errors() {
        let err: PipelineError = BrokerError::Unavailable("down".into()).into();
        assert!(err.is_transient());
        assert_eq!(err.kind(), "broker");
        assert_eq!(err.to_string(), "Broker error: Broker unavailable: down");

        let err: PipelineError = StoreError::WriteRejected("full".into()).into();
        assert!(err.is_transient());
        assert_eq!(err.kind(), "store");

        let err: PipelineError = actlog_core::Error::Decode("bad json".into()).into();
        assert!(matches!(err, PipelineError::Decode(ref m) if m == "bad json"));
        assert!(!err.is_transient());

        let err: PipelineError = actlog_core::Error::Encode("nan".into()).into();
        assert_eq!(err.kind(), "internal");
    }

    #[test]
    fn test_closed_handles_are_not_transient() {
        let err: PipelineError = StoreError::Closed.into();
        assert_eq!(err.kind(), "store");
        assert!(!err.is_transient());

        let err: PipelineError = BrokerError::Closed.into();
        assert!(!err.is_transient());

        let err: PipelineError = BrokerError::InvalidMarker { partition: 0, offset: 1 }.into();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_shutdown_timeout_display() {
        let err = PipelineError::ShutdownTimeout(Duration::from_secs(5));
        assert_eq!(err.to_string(), "Shutdown timed out after 5s");
        assert!(!err.is_transient());
    }
}
