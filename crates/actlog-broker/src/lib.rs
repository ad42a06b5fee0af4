//! Broker access for the activity log pipeline.
//!
//! [`BrokerClient`] is the seam between the pipeline and the message broker.
//! [`InMemoryBroker`] implements it over a shared partitioned log and is
//! what the binary and the tests run against.

pub mod client;
pub mod error;
pub mod memory;

pub use client::{BrokerClient, BrokerMessage, ConsumedBatch, OutgoingMessage};
pub use error::{BrokerError, Result};
pub use memory::{InMemoryBroker, InMemoryBrokerClient};
