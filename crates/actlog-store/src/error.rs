//! Store Error Types
//!
//! ## Error Categories
//!
//! ### Availability Errors
//! - `Unavailable`: the store could not be reached
//! - `WriteRejected`: the store was reached but refused the write
//! - `Closed`: the store handle was already released
//!
//! ### Request Errors
//! - `InvalidQuery`: pagination or time range out of bounds
//!
//! ### Cache Errors
//! - `Cache`: the query cache failed; callers fall back to the store
//! - `Serialization`: a cached value could not be encoded or decoded
//!
//! A failed `bulk_insert` never reports which records made it: the whole
//! call is to be treated as not persisted and retried as a unit.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Write rejected: {0}")]
    WriteRejected(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store closed")]
    Closed,
}

impl StoreError {
    /// Whether the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::WriteRejected(_) | StoreError::Cache(_)
        )
    }
}
