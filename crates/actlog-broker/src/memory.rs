//! In-Memory Broker
//!
//! A partitioned, append-only log with per-group committed offsets, shared by
//! every client created from the same [`InMemoryBroker`]. It behaves like a
//! single-topic broker for the pieces the pipeline relies on:
//!
//! - Messages with the same key go to the same partition (SipHash of the key).
//! - Each client keeps its own fetch position and resolved markers.
//! - Committed offsets outlive clients, so a new client in the same group
//!   resumes where the last commit left off. This is how a consumer restart
//!   after a crash is modelled.
//!
//! Fault injection (`set_unavailable`, `fail_next_sends`, `fail_next_commits`)
//! lets tests drive the retry and redelivery paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use actlog_core::partition_for;
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace};

use crate::client::{BrokerClient, BrokerMessage, ConsumedBatch, OutgoingMessage};
use crate::error::{BrokerError, Result};

struct Cluster {
    partitions: Vec<Vec<BrokerMessage>>,
    /// group id -> partition -> next offset to consume
    committed: HashMap<String, HashMap<u32, u64>>,
}

struct Shared {
    topic: String,
    cluster: Mutex<Cluster>,
    notify: Notify,
    unavailable: AtomicBool,
    fail_sends: AtomicUsize,
    fail_commits: AtomicUsize,
    heartbeats: AtomicU64,
    sends: AtomicU64,
}

impl Shared {
    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable(format!(
                "topic '{}' has no available leader",
                self.topic
            )));
        }
        Ok(())
    }
}

fn take_fault(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Handle to an in-memory topic. Cloning shares the same log.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new(topic: impl Into<String>, partition_count: u32) -> Self {
        let partition_count = partition_count.max(1) as usize;
        Self {
            shared: Arc::new(Shared {
                topic: topic.into(),
                cluster: Mutex::new(Cluster {
                    partitions: vec![Vec::new(); partition_count],
                    committed: HashMap::new(),
                }),
                notify: Notify::new(),
                unavailable: AtomicBool::new(false),
                fail_sends: AtomicUsize::new(0),
                fail_commits: AtomicUsize::new(0),
                heartbeats: AtomicU64::new(0),
                sends: AtomicU64::new(0),
            }),
        }
    }

    /// Create a client bound to `group_id`. Producers can use any group.
    pub fn client(&self, group_id: impl Into<String>) -> InMemoryBrokerClient {
        InMemoryBrokerClient {
            shared: Arc::clone(&self.shared),
            group_id: group_id.into(),
            session: Mutex::new(Session::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    pub async fn partition_count(&self) -> u32 {
        self.shared.cluster.lock().await.partitions.len() as u32
    }

    /// Make every call fail with `Unavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Reject the next `n` send calls.
    pub fn fail_next_sends(&self, n: usize) {
        self.shared.fail_sends.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` commit calls.
    pub fn fail_next_commits(&self, n: usize) {
        self.shared.fail_commits.store(n, Ordering::SeqCst);
    }

    pub async fn messages(&self, partition: u32) -> Vec<BrokerMessage> {
        let cluster = self.shared.cluster.lock().await;
        cluster
            .partitions
            .get(partition as usize)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn total_messages(&self) -> usize {
        let cluster = self.shared.cluster.lock().await;
        cluster.partitions.iter().map(Vec::len).sum()
    }

    /// Next offset `group_id` will consume from `partition`, if it ever committed.
    pub async fn committed_offset(&self, group_id: &str, partition: u32) -> Option<u64> {
        let cluster = self.shared.cluster.lock().await;
        cluster
            .committed
            .get(group_id)
            .and_then(|offsets| offsets.get(&partition))
            .copied()
    }

    /// Number of successful send calls.
    pub fn send_count(&self) -> u64 {
        self.shared.sends.load(Ordering::SeqCst)
    }

    pub fn heartbeat_count(&self) -> u64 {
        self.shared.heartbeats.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Session {
    /// Next offset to fetch per partition. Loaded from committed offsets on
    /// first use and after a rewind.
    positions: Option<Vec<u64>>,
    /// partition -> offset one past the last resolved message
    resolved: HashMap<u32, u64>,
    next_partition: usize,
}

pub struct InMemoryBrokerClient {
    shared: Arc<Shared>,
    group_id: String,
    session: Mutex<Session>,
    closed: AtomicBool,
}

impl InMemoryBrokerClient {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    fn committed_positions(&self, cluster: &Cluster) -> Vec<u64> {
        let committed = cluster.committed.get(&self.group_id);
        (0..cluster.partitions.len() as u32)
            .map(|p| committed.and_then(|c| c.get(&p)).copied().unwrap_or(0))
            .collect()
    }

    fn fetch(&self, cluster: &Cluster, session: &mut Session, max_records: usize) -> ConsumedBatch {
        let partition_count = cluster.partitions.len();
        if session.positions.is_none() {
            session.positions = Some(self.committed_positions(cluster));
        }
        let start = session.next_partition % partition_count;
        let positions = match session.positions.as_mut() {
            Some(positions) => positions,
            None => return ConsumedBatch::default(),
        };

        let mut messages = Vec::new();
        for i in 0..partition_count {
            if messages.len() >= max_records {
                break;
            }
            let p = (start + i) % partition_count;
            let log = &cluster.partitions[p];
            let from = positions[p] as usize;
            if from >= log.len() {
                continue;
            }
            let take = (max_records - messages.len()).min(log.len() - from);
            messages.extend_from_slice(&log[from..from + take]);
            positions[p] += take as u64;
        }
        session.next_partition = (start + 1) % partition_count;

        ConsumedBatch { messages }
    }
}

#[async_trait]
impl BrokerClient for InMemoryBrokerClient {
    async fn connect(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.check_available()
    }

    async fn send(&self, messages: &[OutgoingMessage]) -> Result<()> {
        self.ensure_open()?;
        self.shared.check_available()?;
        if take_fault(&self.shared.fail_sends) {
            return Err(BrokerError::SendRejected("injected send failure".to_string()));
        }

        {
            let mut cluster = self.shared.cluster.lock().await;
            let partition_count = cluster.partitions.len() as u32;
            let timestamp = now_ms();
            for msg in messages {
                let partition = partition_for(&msg.key, partition_count);
                let log = &mut cluster.partitions[partition as usize];
                let offset = log.len() as u64;
                log.push(BrokerMessage {
                    partition,
                    offset,
                    key: msg.key.clone(),
                    payload: msg.payload.clone(),
                    timestamp,
                });
            }
        }
        self.shared.sends.fetch_add(1, Ordering::SeqCst);
        self.shared.notify.notify_waiters();

        trace!(topic = %self.shared.topic, count = messages.len(), "Appended messages");
        Ok(())
    }

    async fn poll(&self, max_records: usize, timeout: Duration) -> Result<ConsumedBatch> {
        self.ensure_open()?;
        let max_records = max_records.max(1);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Registered before the fetch so a send in between still wakes us.
            let notified = self.shared.notify.notified();
            self.shared.check_available()?;

            {
                let cluster = self.shared.cluster.lock().await;
                let mut session = self.session.lock().await;
                let batch = self.fetch(&cluster, &mut session, max_records);
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(ConsumedBatch::default());
            }
        }
    }

    async fn resolve_marker(&self, partition: u32, offset: u64) -> Result<()> {
        self.ensure_open()?;
        let cluster = self.shared.cluster.lock().await;
        if partition as usize >= cluster.partitions.len() {
            return Err(BrokerError::UnknownPartition(partition));
        }
        let mut session = self.session.lock().await;
        let delivered = session
            .positions
            .as_ref()
            .map(|positions| offset < positions[partition as usize])
            .unwrap_or(false);
        if !delivered {
            return Err(BrokerError::InvalidMarker { partition, offset });
        }

        let marker = session.resolved.entry(partition).or_insert(0);
        *marker = (*marker).max(offset + 1);
        Ok(())
    }

    async fn commit_resolved(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.check_available()?;
        if take_fault(&self.shared.fail_commits) {
            return Err(BrokerError::Unavailable("injected commit failure".to_string()));
        }

        let mut cluster = self.shared.cluster.lock().await;
        let mut session = self.session.lock().await;
        let offsets = cluster.committed.entry(self.group_id.clone()).or_default();
        for (partition, next) in session.resolved.drain() {
            let committed = offsets.entry(partition).or_insert(0);
            *committed = (*committed).max(next);
            debug!(
                group_id = %self.group_id,
                partition,
                offset = *committed,
                "Committed offset"
            );
        }
        Ok(())
    }

    async fn heartbeat(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.check_available()?;
        self.shared.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rewind(&self) -> Result<()> {
        self.ensure_open()?;
        let cluster = self.shared.cluster.lock().await;
        let mut session = self.session.lock().await;
        session.positions = Some(self.committed_positions(&cluster));
        session.resolved.clear();
        debug!(group_id = %self.group_id, "Rewound to committed offsets");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
