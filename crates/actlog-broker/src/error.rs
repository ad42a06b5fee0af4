//! Broker Error Types
//!
//! Every broker error is transient from the pipeline's point of view: the
//! caller decides whether to retry, rewind or give up. None of them are
//! retried inside the broker client itself.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Broker cannot be reached (connection refused, leader unavailable, ...).
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// Broker was reached but refused the write.
    #[error("Send rejected: {0}")]
    SendRejected(String),

    /// Tried to resolve a marker for a message that was never delivered.
    #[error("Invalid marker {offset} for partition {partition}")]
    InvalidMarker { partition: u32, offset: u64 },

    #[error("Unknown partition: {0}")]
    UnknownPartition(u32),

    /// The client was closed and can no longer be used.
    #[error("Broker client closed")]
    Closed,
}

impl BrokerError {
    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_) | BrokerError::SendRejected(_))
    }
}
