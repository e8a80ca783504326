//! Consumption path: pop from the buffering boundary, extract features,
//! score, persist, and alert.
//!
//! Runs as a single consumer so rolling-state updates for the same address
//! are applied in arrival order. Delivery is at-least-once upstream, so
//! records are deduplicated by transaction id over a bounded recent window.

use crate::extractor::FeatureExtractor;
use crate::metrics::PipelineMetrics;
use crate::queue::TransactionQueue;
use crate::scoring::ScoringEngine;
use crate::sink::AlertSink;
use crate::store::FeatureStore;
use crate::types::{AlertEvent, AnomalyEvent, TransactionRecord};
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Bounded recent-id window for idempotent consumption.
struct SeenIds {
    set: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns `false` when the id was already seen.
    fn insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        self.set.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

pub struct PipelineOptions {
    /// Bounded wait per pop so the loop stays responsive while idle.
    pub pop_timeout: Duration,
    /// Capacity of the duplicate-suppression window.
    pub seen_ids_capacity: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            pop_timeout: Duration::from_millis(500),
            seen_ids_capacity: 100_000,
        }
    }
}

/// The scoring consumption loop.
pub struct Pipeline {
    queue: Arc<TransactionQueue>,
    extractor: Arc<FeatureExtractor>,
    engine: Arc<ScoringEngine>,
    features: Arc<dyn FeatureStore>,
    sink: Arc<dyn AlertSink>,
    metrics: Arc<PipelineMetrics>,
    options: PipelineOptions,
    seen: SeenIds,
}

impl Pipeline {
    pub fn new(
        queue: Arc<TransactionQueue>,
        extractor: Arc<FeatureExtractor>,
        engine: Arc<ScoringEngine>,
        features: Arc<dyn FeatureStore>,
        sink: Arc<dyn AlertSink>,
        metrics: Arc<PipelineMetrics>,
        options: PipelineOptions,
    ) -> Self {
        let seen = SeenIds::new(options.seen_ids_capacity);
        Self {
            queue,
            extractor,
            engine,
            features,
            sink,
            metrics,
            options,
            seen,
        }
    }

    /// Consume forever. Idle periods run rolling-state eviction and keep
    /// the queue-depth gauge fresh.
    pub async fn run(mut self) {
        loop {
            match self.queue.pop(self.options.pop_timeout).await {
                Some(record) => {
                    self.handle(record).await;
                    self.metrics.set_queue_depth(self.queue.depth());
                }
                None => {
                    let evicted = self.extractor.evict_stale(Utc::now());
                    if evicted > 0 {
                        debug!(evicted, "Evicted idle rolling-state addresses");
                    }
                    self.metrics.set_queue_depth(self.queue.depth());
                }
            }
        }
    }

    /// Process one record end to end.
    pub async fn handle(&mut self, record: TransactionRecord) {
        if !self.seen.insert(&record.id) {
            debug!(transaction_id = %record.id, "Duplicate delivery suppressed");
            return;
        }

        let start = Instant::now();
        let features = self.extractor.process(&record);
        let evaluation = self.engine.evaluate(&record, &features);

        if let Err(e) = self.features.write(&features) {
            warn!(transaction_id = %record.id, error = %e, "Feature store write failed");
        }

        if let Some(whale) = evaluation.whale {
            self.metrics.whales_total.fetch_add(1, Ordering::Relaxed);
            debug!(
                transaction_id = %whale.transaction_id,
                value = whale.value,
                threshold = whale.threshold_used,
                "Whale transaction detected"
            );
            let _ = self.sink.notify(&AlertEvent::Whale(whale)).await;
        }

        if let Some(result) = evaluation.result {
            self.metrics
                .record_scored(start.elapsed(), result.anomaly_score);

            if result.is_anomaly {
                self.metrics.anomalies_total.fetch_add(1, Ordering::Relaxed);
                let threshold = evaluation.decision_threshold.unwrap_or_default();
                let event = AnomalyEvent::from_score(&result, threshold);
                debug!(
                    transaction_id = %event.transaction_id,
                    anomaly_score = event.anomaly_score,
                    model_version = event.model_version,
                    "Anomalous transaction detected"
                );
                let _ = self.sink.notify(&AlertEvent::Anomaly(event)).await;
            }
        } else {
            self.metrics.record_processing_time(start.elapsed());
        }

        if let Some(error) = evaluation.error {
            self.metrics
                .scoring_errors_total
                .fetch_add(1, Ordering::Relaxed);
            warn!(transaction_id = %record.id, error = %error, "Scoring failed for event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryFeatureStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<AlertEvent>>,
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn notify(&self, event: &AlertEvent) -> anyhow::Result<()> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    fn record(id: &str, value: u64) -> TransactionRecord {
        let out: BTreeSet<String> = ["1Dest".to_string()].into();
        TransactionRecord::new(
            id,
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            value,
            300,
            BTreeSet::new(),
            out,
        )
    }

    fn pipeline(
        sink: Arc<RecordingSink>,
        store: Arc<InMemoryFeatureStore>,
        metrics: Arc<PipelineMetrics>,
    ) -> Pipeline {
        Pipeline::new(
            Arc::new(TransactionQueue::new(64)),
            Arc::new(FeatureExtractor::new(chrono::Duration::hours(1), 1000)),
            Arc::new(ScoringEngine::new(1_000_000_000)),
            store,
            sink,
            metrics,
            PipelineOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_whale_flows_to_sink_without_model() {
        let sink = Arc::new(RecordingSink::default());
        let store = Arc::new(InMemoryFeatureStore::new(1000));
        let metrics = Arc::new(PipelineMetrics::new());
        let mut pipeline = pipeline(sink.clone(), store.clone(), metrics.clone());

        pipeline.handle(record("tx1", 2_000_000_000)).await;

        assert_eq!(metrics.whales_total.load(Ordering::Relaxed), 1);
        assert_eq!(store.len(), 1);
        let events = sink.events.lock();
        assert!(matches!(events.as_slice(), [AlertEvent::Whale(_)]));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_suppressed() {
        let sink = Arc::new(RecordingSink::default());
        let store = Arc::new(InMemoryFeatureStore::new(1000));
        let metrics = Arc::new(PipelineMetrics::new());
        let mut pipeline = pipeline(sink.clone(), store.clone(), metrics.clone());

        pipeline.handle(record("tx1", 2_000_000_000)).await;
        pipeline.handle(record("tx1", 2_000_000_000)).await;

        // Whale alerted once, feature written once, not amplified.
        assert_eq!(metrics.whales_total.load(Ordering::Relaxed), 1);
        assert_eq!(sink.events.lock().len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_seen_ids_window_is_bounded() {
        let mut seen = SeenIds::new(2);
        assert!(seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(seen.insert("c"));
        // "a" fell out of the window, so it reads as new again.
        assert!(seen.insert("a"));
        assert!(!seen.insert("c"));
    }
}
