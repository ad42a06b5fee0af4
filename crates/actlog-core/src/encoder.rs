//! Record Encoder
//!
//! Turns a [`Record`] into the pair the broker needs: a partition key and a
//! serialized payload. The payload is the record's JSON form, so any consumer
//! that can read JSON can read the topic.
//!
//! ## Partition Routing
//!
//! The key is hashed with SipHash and reduced modulo the partition count. The
//! same key always lands on the same partition, which is what gives records
//! sharing a key their relative ordering.

use bytes::Bytes;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};
use crate::record::Record;

/// Routing key derived from a record (`userId`, else `service`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Partition this key routes to for a topic with `partition_count` partitions.
    pub fn partition(&self, partition_count: u32) -> u32 {
        partition_for(self.as_bytes(), partition_count)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A record ready to be handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedRecord {
    /// Id of the encoded record, kept for logging and acknowledgements.
    pub id: String,
    pub key: PartitionKey,
    pub payload: Bytes,
}

impl EncodedRecord {
    /// Approximate in-memory size: key + payload.
    pub fn size_bytes(&self) -> usize {
        self.key.as_bytes().len() + self.payload.len()
    }
}

/// Encode a record into its partition key and JSON payload.
pub fn encode(record: &Record) -> Result<EncodedRecord> {
    let payload = serde_json::to_vec(record).map_err(|e| Error::Encode(e.to_string()))?;
    Ok(EncodedRecord {
        id: record.id.clone(),
        key: record.partition_key(),
        payload: Bytes::from(payload),
    })
}

/// Decode a broker payload back into a record.
///
/// A missing `createdAt` defaults to the decode time.
pub fn decode(payload: &[u8]) -> Result<Record> {
    if payload.is_empty() {
        return Err(Error::Decode("empty payload".to_string()));
    }
    serde_json::from_slice(payload).map_err(|e| Error::Decode(e.to_string()))
}

/// SipHash the key and reduce it modulo `partition_count`.
///
/// A partition count of zero is treated as a single partition.
pub fn partition_for(key: &[u8], partition_count: u32) -> u32 {
    if partition_count <= 1 {
        return 0;
    }
    let mut hasher = siphasher::sip::SipHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partition_count as u64) as u32
}
