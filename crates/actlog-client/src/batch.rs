//! Pending Batch
//!
//! The in-memory accumulator behind both dual-trigger batchers: the
//! producer's [`crate::IngestionBuffer`] and the consumer's local batch.
//!
//! ```text
//! append(...) ──► PendingBatch ──┬─→ full: len >= batch_size   (size trigger)
//!                                ├─→ expired: age >= interval  (time trigger)
//!                                └─→ drain(): swap for an empty batch
//! ```
//!
//! Every drain bumps the generation. A deferred timer captures the
//! generation it was armed for and fires only if it still matches, so a
//! timer that lost the race against a size-triggered drain is a no-op.
//!
//! `PendingBatch` is not thread-safe. Owners wrap it in a mutex or keep it
//! inside a single task.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

/// Why a batch was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushTrigger {
    /// Batch reached `batch_size`
    Size,
    /// `flush_interval` elapsed since the first record
    Timer,
    /// Caller asked for a flush
    Explicit,
    /// Final flush during shutdown
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timer => "timer",
            FlushTrigger::Explicit => "explicit",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct PendingBatch<T> {
    items: Vec<T>,
    /// When the first item of the current batch arrived
    started_at: Option<Instant>,
    batch_size: usize,
    flush_interval: Duration,
    generation: u64,
}

impl<T> PendingBatch<T> {
    pub fn new(batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            items: Vec::with_capacity(batch_size),
            started_at: None,
            batch_size,
            flush_interval,
            generation: 0,
        }
    }

    /// Append an item. Returns `true` when it is the first item of a new
    /// batch, which is when a deferred flush should be armed.
    pub fn append(&mut self, item: T) -> bool {
        let first = self.items.is_empty();
        if first {
            self.started_at = Some(Instant::now());
        }
        self.items.push(item);
        trace!(
            record_count = self.items.len(),
            batch_size = self.batch_size,
            "Appended record to batch"
        );
        first
    }

    /// Size trigger: the batch reached `batch_size`.
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.batch_size
    }

    /// Time trigger: the oldest item has waited `flush_interval`.
    pub fn is_expired(&self) -> bool {
        match self.started_at {
            Some(started) if !self.items.is_empty() => started.elapsed() >= self.flush_interval,
            _ => false,
        }
    }

    /// Time left until the time trigger fires, if anything is buffered.
    pub fn time_remaining(&self) -> Option<Duration> {
        if self.items.is_empty() {
            return None;
        }
        let started = self.started_at?;
        Some(self.flush_interval.saturating_sub(started.elapsed()))
    }

    /// Swap the batch for an empty one and return its items.
    pub fn drain(&mut self) -> Vec<T> {
        let items = std::mem::replace(&mut self.items, Vec::with_capacity(self.batch_size));
        self.started_at = None;
        self.generation += 1;
        debug!(
            record_count = items.len(),
            generation = self.generation,
            "Drained pending batch"
        );
        items
    }

    /// Incremented on every drain.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }
}
