//! Bounded buffering boundary between ingestion and processing.
//!
//! The queue decouples the feed connection from feature extraction and
//! scoring. It never blocks the producer: when full, the oldest entry is
//! evicted and counted. Delivery is at-least-once from the consumer's point
//! of view; the scoring path dedupes by transaction id.

use crate::types::TransactionRecord;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Result of a push into the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Record accepted with free capacity remaining.
    Accepted,
    /// Record accepted; the oldest queued record was evicted to make room.
    AcceptedDroppedOldest,
}

/// Bounded in-process transaction queue with a drop-oldest overflow policy.
pub struct TransactionQueue {
    inner: Mutex<VecDeque<TransactionRecord>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl TransactionQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push a record, evicting the oldest entry when at capacity. Never
    /// blocks and never fails.
    pub fn push(&self, record: TransactionRecord) -> PushOutcome {
        let outcome = {
            let mut queue = self.inner.lock();
            let outcome = if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::AcceptedDroppedOldest
            } else {
                PushOutcome::Accepted
            };
            queue.push_back(record);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Pop the oldest record, waiting at most `timeout`. Returns `None` on
    /// expiry so callers stay responsive to shutdown and health checks.
    pub async fn pop(&self, timeout: Duration) -> Option<TransactionRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register for wakeup before checking, so a push between the
            // check and the await is not lost.
            let notified = self.notify.notified();
            if let Some(record) = self.inner.lock().pop_front() {
                return Some(record);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.inner.lock().pop_front();
            }
        }
    }

    /// Non-blocking pop, used by tests and drain paths.
    pub fn try_pop(&self) -> Option<TransactionRecord> {
        self.inner.lock().pop_front()
    }

    /// Current queue depth, exposed as the `queue_depth` gauge.
    pub fn depth(&self) -> usize {
        self.inner.lock().len()
    }

    /// Total records evicted by the drop-oldest policy.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
