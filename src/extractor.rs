//! Feature extraction combining per-transaction fields with rolling
//! per-address aggregates.
//!
//! Extraction is deterministic: an identical record applied to an identical
//! rolling-state snapshot always yields the same vector. The window is
//! evaluated in event time (record timestamps), so replaying a stream
//! reproduces the original features exactly.

use crate::types::feature::{FeatureVector, FEATURE_COUNT};
use crate::types::TransactionRecord;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Per-address activity inside the trailing window.
#[derive(Debug, Default)]
struct AddressWindow {
    /// Transaction observations as `(timestamp, total_value)`.
    events: VecDeque<(DateTime<Utc>, u64)>,
    /// Running sum of `events` values.
    total_value: u64,
    last_seen: Option<DateTime<Utc>>,
}

impl AddressWindow {
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        while let Some(&(ts, value)) = self.events.front() {
            if ts >= cutoff {
                break;
            }
            self.events.pop_front();
            self.total_value -= value;
        }
    }
}

/// Rolling, address-keyed aggregates over a trailing time window.
///
/// Bounded two ways: entries older than the window are pruned on every
/// observation, and the table itself is capped with least-recently-seen
/// eviction so a flood of fresh addresses cannot grow memory without limit.
pub struct RollingState {
    window: Duration,
    max_addresses: usize,
    table: HashMap<String, AddressWindow>,
}

impl RollingState {
    pub fn new(window: Duration, max_addresses: usize) -> Self {
        Self {
            window,
            max_addresses,
            table: HashMap::new(),
        }
    }

    /// Record a transaction's outputs into the window. Updates for the same
    /// address must arrive in stream order; the extractor's lock enforces
    /// this.
    pub fn observe(&mut self, record: &TransactionRecord) {
        let cutoff = record.timestamp - self.window;

        for addr in &record.output_addresses {
            let entry = self.table.entry(addr.clone()).or_default();
            entry.prune(cutoff);
            entry.events.push_back((record.timestamp, record.total_value));
            entry.total_value += record.total_value;
            entry.last_seen = Some(record.timestamp);
        }

        if self.table.len() > self.max_addresses {
            self.evict_least_recent(self.table.len() - self.max_addresses);
        }
    }

    /// Window aggregates for one address: `(tx_count, total_value)`.
    pub fn velocity(&self, address: &str) -> (u64, u64) {
        match self.table.get(address) {
            Some(w) => (w.events.len() as u64, w.total_value),
            None => (0, 0),
        }
    }

    /// Drop addresses whose newest observation is older than the window.
    pub fn evict_stale(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window;
        let before = self.table.len();
        self.table.retain(|_, w| matches!(w.last_seen, Some(ts) if ts >= cutoff));
        before - self.table.len()
    }

    fn evict_least_recent(&mut self, count: usize) {
        for _ in 0..count {
            let oldest = self
                .table
                .iter()
                .min_by_key(|(_, w)| w.last_seen)
                .map(|(addr, _)| addr.clone());
            match oldest {
                Some(addr) => {
                    self.table.remove(&addr);
                }
                None => break,
            }
        }
    }

    pub fn tracked_addresses(&self) -> usize {
        self.table.len()
    }
}

/// Extracts fixed-shape feature vectors, owning the rolling state as its
/// single writer. Eviction shares the same lock, so it can never race an
/// in-flight extraction.
pub struct FeatureExtractor {
    state: Mutex<RollingState>,
}

impl FeatureExtractor {
    pub fn new(window: Duration, max_addresses: usize) -> Self {
        Self {
            state: Mutex::new(RollingState::new(window, max_addresses)),
        }
    }

    /// Observe the record into the rolling state and extract its features,
    /// atomically with respect to other records and to eviction.
    pub fn process(&self, record: &TransactionRecord) -> FeatureVector {
        let mut state = self.state.lock();
        state.observe(record);
        Self::extract(record, &state)
    }

    /// Pure extraction from a record and a state snapshot. Deterministic:
    /// identical inputs always yield identical output.
    pub fn extract(record: &TransactionRecord, state: &RollingState) -> FeatureVector {
        // Velocity features follow the busiest involved output address.
        let (addr_count, addr_total) = record
            .output_addresses
            .iter()
            .map(|a| state.velocity(a))
            .max_by_key(|&(count, _)| count)
            .unwrap_or((0, 0));

        let addr_mean = if addr_count > 0 {
            addr_total as f64 / addr_count as f64
        } else {
            0.0
        };

        let values = vec![
            record.total_value as f64,
            record.fee as f64,
            record.input_count as f64,
            record.output_count as f64,
            record.fee as f64 / (record.total_value as f64 + 1.0),
            addr_count as f64,
            addr_total as f64,
            addr_mean,
        ];

        FeatureVector::new(record.id.clone(), values, record.timestamp)
    }

    /// Time-based eviction entry point for the idle path of the consumer
    /// loop. Returns the number of addresses dropped.
    pub fn evict_stale(&self, now: DateTime<Utc>) -> usize {
        self.state.lock().evict_stale(now)
    }

    pub fn tracked_addresses(&self) -> usize {
        self.state.lock().tracked_addresses()
    }

    pub fn feature_count(&self) -> usize {
        FEATURE_COUNT
    }
}
