//! Activity Log Core
//!
//! Shared types for the activity log ingestion pipeline: the immutable
//! [`Record`] accepted from callers, the [`PartitionKey`] that routes it, and
//! the encoder that turns a record into a broker message and back.
//!
//! ## Data Flow
//!
//! ```text
//! LogEntry ──accept──► Record ──encode──► EncodedRecord { key, payload }
//!                                               │
//!                                        broker message
//!                                               │
//!                       Record ◄──decode────────┘
//! ```

pub mod encoder;
pub mod error;
pub mod record;

pub use encoder::{decode, encode, partition_for, EncodedRecord, PartitionKey};
pub use error::{Error, Result};
pub use record::{LogEntry, Record, Severity};
