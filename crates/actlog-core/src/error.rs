//! Error Types for the Activity Log Core
//!
//! ## Error Categories
//!
//! - `Encode`: a record could not be serialized into a broker payload
//! - `Decode`: a broker payload is not a valid record (poison message)
//!
//! Decode errors are expected in normal operation: the consumer skips the
//! offending message and still advances its progress marker.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors caused by a malformed payload.
    pub fn is_decode(&self) -> bool {
        matches!(self, Error::Decode(_))
    }
}
