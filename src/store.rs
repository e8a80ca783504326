//! Feature store behind a narrow read/write contract.
//!
//! The pipeline writes every extracted vector; the retraining loop reads
//! bounded historical windows. The in-memory implementation keeps a capped
//! insertion-ordered buffer and overwrites on transaction id, matching the
//! "recomputation overwrites" rule.

use crate::types::FeatureVector;
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Narrow contract for the external feature store.
pub trait FeatureStore: Send + Sync {
    fn write(&self, vector: &FeatureVector) -> Result<()>;

    /// All vectors whose extraction timestamp falls in `[start, end)`,
    /// ordered by extraction time.
    fn read_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<FeatureVector>>;
}

struct Inner {
    by_id: HashMap<String, FeatureVector>,
    order: VecDeque<String>,
}

/// Bounded in-memory feature store.
pub struct InMemoryFeatureStore {
    inner: Mutex<Inner>,
    retention: usize,
}

impl InMemoryFeatureStore {
    pub fn new(retention: usize) -> Self {
        assert!(retention > 0, "feature retention must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                by_id: HashMap::new(),
                order: VecDeque::new(),
            }),
            retention,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FeatureStore for InMemoryFeatureStore {
    fn write(&self, vector: &FeatureVector) -> Result<()> {
        let mut inner = self.inner.lock();

        if inner.by_id.contains_key(&vector.transaction_id) {
            // Recomputation overwrites in place; insertion order is kept.
            inner
                .by_id
                .insert(vector.transaction_id.clone(), vector.clone());
            return Ok(());
        }

        inner.order.push_back(vector.transaction_id.clone());
        inner
            .by_id
            .insert(vector.transaction_id.clone(), vector.clone());

        while inner.order.len() > self.retention {
            if let Some(oldest) = inner.order.pop_front() {
                inner.by_id.remove(&oldest);
            }
        }
        Ok(())
    }

    fn read_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<FeatureVector>> {
        let inner = self.inner.lock();
        let mut window: Vec<FeatureVector> = inner
            .by_id
            .values()
            .filter(|fv| fv.extracted_at >= start && fv.extracted_at < end)
            .cloned()
            .collect();
        window.sort_by_key(|fv| fv.extracted_at);
        Ok(window)
    }
}
