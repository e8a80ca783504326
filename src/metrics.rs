//! Operational counters, gauges, and latency statistics for the pipeline.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::info;

/// Metrics collector shared across pipeline components. Counters are
/// monotonic; gauges hold the latest observation. A serializable snapshot
/// is exposed for external scraping.
pub struct PipelineMetrics {
    /// Transactions accepted from the feed.
    pub ingested_total: AtomicU64,
    /// Records evicted by the buffering boundary's drop-oldest policy.
    pub dropped_total: AtomicU64,
    /// Feed messages dropped by the decoder.
    pub decode_failures_total: AtomicU64,
    /// Transactions scored by the active model.
    pub scored_total: AtomicU64,
    /// Transactions flagged anomalous.
    pub anomalies_total: AtomicU64,
    /// Whale events emitted.
    pub whales_total: AtomicU64,
    /// Per-event scoring errors caught.
    pub scoring_errors_total: AtomicU64,
    /// Retraining cycles attempted.
    pub retrain_total: AtomicU64,
    /// Retraining cycles that ended rolled back.
    pub retrain_failures_total: AtomicU64,

    /// Current buffering boundary depth.
    queue_depth: AtomicU64,
    /// Version of the active model, 0 while degraded.
    active_model_version: AtomicU64,
    /// Most recent drift statistic (f64 bits).
    last_drift_score: AtomicU64,

    /// Per-event processing times in microseconds.
    processing_times: RwLock<Vec<u64>>,
    /// Anomaly score distribution buckets.
    score_buckets: RwLock<[u64; 10]>,
    start_time: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            ingested_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            decode_failures_total: AtomicU64::new(0),
            scored_total: AtomicU64::new(0),
            anomalies_total: AtomicU64::new(0),
            whales_total: AtomicU64::new(0),
            scoring_errors_total: AtomicU64::new(0),
            retrain_total: AtomicU64::new(0),
            retrain_failures_total: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            active_model_version: AtomicU64::new(0),
            last_drift_score: AtomicU64::new(0f64.to_bits()),
            processing_times: RwLock::new(Vec::with_capacity(1000)),
            score_buckets: RwLock::new([0; 10]),
            start_time: Instant::now(),
        }
    }

    /// Record one scored transaction.
    pub fn record_scored(&self, processing_time: Duration, anomaly_score: f64) {
        self.scored_total.fetch_add(1, Ordering::Relaxed);
        self.record_processing_time(processing_time);

        let bucket = ((anomaly_score * 10.0) as usize).min(9);
        if let Ok(mut buckets) = self.score_buckets.write() {
            buckets[bucket] += 1;
        }
    }

    pub fn record_processing_time(&self, processing_time: Duration) {
        if let Ok(mut times) = self.processing_times.write() {
            times.push(processing_time.as_micros() as u64);
            // Keep only the most recent samples for memory efficiency.
            if times.len() > 10000 {
                times.drain(0..5000);
            }
        }
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth as u64, Ordering::Relaxed);
    }

    pub fn set_active_model_version(&self, version: u64) {
        self.active_model_version.store(version, Ordering::Relaxed);
    }

    pub fn set_last_drift_score(&self, score: f64) {
        self.last_drift_score
            .store(score.to_bits(), Ordering::Relaxed);
    }

    pub fn last_drift_score(&self) -> f64 {
        f64::from_bits(self.last_drift_score.load(Ordering::Relaxed))
    }

    /// Processing time statistics over the retained samples.
    pub fn get_processing_stats(&self) -> ProcessingStats {
        let times = self.processing_times.read().unwrap();
        if times.is_empty() {
            return ProcessingStats::default();
        }

        let mut sorted: Vec<u64> = times.clone();
        sorted.sort_unstable();

        let sum: u64 = sorted.iter().sum();
        let count = sorted.len();

        ProcessingStats {
            count: count as u64,
            mean_us: sum / count as u64,
            p50_us: sorted[count / 2],
            p95_us: sorted[(count as f64 * 0.95) as usize],
            p99_us: sorted[(count as f64 * 0.99) as usize],
            max_us: *sorted.last().unwrap_or(&0),
        }
    }

    /// Current throughput in transactions per second since start.
    pub fn get_throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.ingested_total.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn get_score_distribution(&self) -> [u64; 10] {
        *self.score_buckets.read().unwrap()
    }

    /// Point-in-time view of every counter and gauge, for external
    /// scraping.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ingested_total: self.ingested_total.load(Ordering::Relaxed),
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
            decode_failures_total: self.decode_failures_total.load(Ordering::Relaxed),
            scored_total: self.scored_total.load(Ordering::Relaxed),
            anomalies_total: self.anomalies_total.load(Ordering::Relaxed),
            whales_total: self.whales_total.load(Ordering::Relaxed),
            scoring_errors_total: self.scoring_errors_total.load(Ordering::Relaxed),
            retrain_total: self.retrain_total.load(Ordering::Relaxed),
            retrain_failures_total: self.retrain_failures_total.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            active_model_version: self.active_model_version.load(Ordering::Relaxed),
            last_drift_score: self.last_drift_score(),
        }
    }

    /// Print summary statistics.
    pub fn print_summary(&self) {
        let snap = self.snapshot();
        let anomaly_rate = if snap.scored_total > 0 {
            (snap.anomalies_total as f64 / snap.scored_total as f64) * 100.0
        } else {
            0.0
        };

        let processing = self.get_processing_stats();
        let throughput = self.get_throughput();
        let score_dist = self.get_score_distribution();

        info!("╔══════════════════════════════════════════════════════════════╗");
        info!("║          ANOMALY DETECTION PIPELINE - METRICS SUMMARY        ║");
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Ingested: {:>8}  Dropped: {:>6}  Decode failures: {:>6}  ║",
            snap.ingested_total, snap.dropped_total, snap.decode_failures_total
        );
        info!(
            "║ Scored: {:>8}  Anomalies: {:>6} ({:>5.2}%)  Whales: {:>6} ║",
            snap.scored_total, snap.anomalies_total, anomaly_rate, snap.whales_total
        );
        info!(
            "║ Retrains: {:>4} (failed: {:>3})  Model: v{:<4} Drift: {:>7.4}  ║",
            snap.retrain_total,
            snap.retrain_failures_total,
            snap.active_model_version,
            snap.last_drift_score
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Throughput: {:>7.1} tx/s  Queue depth: {:>6}               ║",
            throughput, snap.queue_depth
        );
        info!(
            "║ Processing (μs): mean={:>5} p50={:>5} p95={:>5} p99={:>5}   ║",
            processing.mean_us, processing.p50_us, processing.p95_us, processing.p99_us
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!("║ Anomaly Score Distribution:                                  ║");
        let total: u64 = score_dist.iter().sum();
        for (i, &count) in score_dist.iter().enumerate() {
            let pct = if total > 0 {
                (count as f64 / total as f64) * 100.0
            } else {
                0.0
            };
            let bar_len = (pct / 2.0) as usize;
            let bar: String = "█".repeat(bar_len.min(20));
            info!(
                "║   {:.1}-{:.1}: {:>6} ({:>5.1}%) {}",
                i as f64 / 10.0,
                (i + 1) as f64 / 10.0,
                count,
                pct,
                bar
            );
        }
        info!("╚══════════════════════════════════════════════════════════════╝");
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Processing time statistics
#[derive(Debug, Default)]
pub struct ProcessingStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Serializable counter/gauge snapshot for external scraping.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub ingested_total: u64,
    pub dropped_total: u64,
    pub decode_failures_total: u64,
    pub scored_total: u64,
    pub anomalies_total: u64,
    pub whales_total: u64,
    pub scoring_errors_total: u64,
    pub retrain_total: u64,
    pub retrain_failures_total: u64,
    pub queue_depth: u64,
    pub active_model_version: u64,
    pub last_drift_score: f64,
}

/// Real-time metrics reporter that prints periodic summaries
pub struct MetricsReporter {
    metrics: std::sync::Arc<PipelineMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: std::sync::Arc<PipelineMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    /// Start the periodic reporting task
    pub async fn start(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs));
        loop {
            interval.tick().await;
            self.metrics.print_summary();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let metrics = PipelineMetrics::new();

        metrics.ingested_total.fetch_add(3, Ordering::Relaxed);
        metrics.record_scored(Duration::from_micros(100), 0.45);
        metrics.record_scored(Duration::from_micros(200), 0.95);
        metrics.anomalies_total.fetch_add(1, Ordering::Relaxed);
        metrics.whales_total.fetch_add(1, Ordering::Relaxed);
        metrics.set_queue_depth(7);
        metrics.set_active_model_version(4);
        metrics.set_last_drift_score(0.31);

        let snap = metrics.snapshot();
        assert_eq!(snap.ingested_total, 3);
        assert_eq!(snap.scored_total, 2);
        assert_eq!(snap.anomalies_total, 1);
        assert_eq!(snap.whales_total, 1);
        assert_eq!(snap.queue_depth, 7);
        assert_eq!(snap.active_model_version, 4);
        assert!((snap.last_drift_score - 0.31).abs() < 1e-12);
    }

    #[test]
    fn test_score_buckets() {
        let metrics = PipelineMetrics::new();
        metrics.record_scored(Duration::from_micros(50), 0.05);
        metrics.record_scored(Duration::from_micros(50), 0.95);
        metrics.record_scored(Duration::from_micros(50), 1.0);

        let dist = metrics.get_score_distribution();
        assert_eq!(dist[0], 1);
        assert_eq!(dist[9], 2);
    }

    #[test]
    fn test_processing_stats() {
        let metrics = PipelineMetrics::new();
        for us in [100u64, 200, 300, 400] {
            metrics.record_processing_time(Duration::from_micros(us));
        }

        let stats = metrics.get_processing_stats();
        assert_eq!(stats.count, 4);
        assert_eq!(stats.mean_us, 250);
        assert_eq!(stats.max_us, 400);
    }
}
