//! Broker Client Contract
//!
//! The pipeline talks to the message broker only through [`BrokerClient`].
//! The producer side uses `send`; the consumer side uses the poll / resolve /
//! commit cycle:
//!
//! ```text
//! poll() ──► ConsumedBatch ──► (persist) ──► resolve_marker() per message
//!                                               │
//!                                               ▼
//!                                        commit_resolved()
//! ```
//!
//! A marker records "every message up to and including this offset has been
//! handled" for one partition. Markers only become durable on
//! `commit_resolved`. If the consumer cannot persist a delivery it calls
//! `rewind`, which drops uncommitted markers and moves the fetch position
//! back to the last committed offset so the same messages are delivered
//! again.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// A message handed to the broker for publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Partition key. Messages with the same key land in the same partition.
    pub key: Bytes,
    pub payload: Bytes,
}

impl OutgoingMessage {
    pub fn new(key: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
        }
    }
}

/// A message as delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub partition: u32,
    pub offset: u64,
    pub key: Bytes,
    pub payload: Bytes,
    /// Append time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// A broker-delivered group of messages spanning one or more partitions.
///
/// Within one partition messages are in offset order.
#[derive(Debug, Clone, Default)]
pub struct ConsumedBatch {
    pub messages: Vec<BrokerMessage>,
}

impl ConsumedBatch {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Highest offset seen per partition, in partition order.
    pub fn last_offsets(&self) -> Vec<(u32, u64)> {
        let mut last: Vec<(u32, u64)> = Vec::new();
        for msg in &self.messages {
            match last.iter_mut().find(|(p, _)| *p == msg.partition) {
                Some(entry) => entry.1 = entry.1.max(msg.offset),
                None => last.push((msg.partition, msg.offset)),
            }
        }
        last.sort_by_key(|(p, _)| *p);
        last
    }
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Probe the broker. Used at startup to decide whether it is reachable.
    async fn connect(&self) -> Result<()>;

    /// Publish a group of messages as a single send operation.
    async fn send(&self, messages: &[OutgoingMessage]) -> Result<()>;

    /// Wait up to `timeout` for messages, returning at most `max_records`.
    ///
    /// An empty batch means the timeout elapsed with nothing to deliver.
    async fn poll(&self, max_records: usize, timeout: Duration) -> Result<ConsumedBatch>;

    /// Mark `offset` in `partition` as handled. Markers never move backwards.
    async fn resolve_marker(&self, partition: u32, offset: u64) -> Result<()>;

    /// Make all resolved markers durable for this consumer group.
    async fn commit_resolved(&self) -> Result<()>;

    /// Tell the broker this consumer is still alive.
    async fn heartbeat(&self) -> Result<()>;

    /// Discard uncommitted markers and resume fetching from the committed
    /// offsets, so uncommitted messages are delivered again.
    async fn rewind(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(partition: u32, offset: u64) -> BrokerMessage {
        BrokerMessage {
            partition,
            offset,
            key: Bytes::from_static(b"k"),
            payload: Bytes::from_static(b"{}"),
            timestamp: 0,
        }
    }

    #[test]
    fn test_last_offsets_per_partition() {
        let batch = ConsumedBatch {
            messages: vec![msg(1, 4), msg(0, 7), msg(1, 5), msg(0, 8), msg(2, 0)],
        };
        assert_eq!(batch.last_offsets(), vec![(0, 8), (1, 5), (2, 0)]);
    }

    #[test]
    fn test_empty_batch() {
        let batch = ConsumedBatch::default();
        assert!(batch.is_empty());
        assert!(batch.last_offsets().is_empty());
    }
}
