//! End-to-end scenarios: outlier detection through the full
//! ingestion → extraction → scoring path, and drift-forced retraining.

use chain_anomaly_pipeline::extractor::FeatureExtractor;
use chain_anomaly_pipeline::ingest::{IngestionClient, IngestionOptions};
use chain_anomaly_pipeline::metrics::PipelineMetrics;
use chain_anomaly_pipeline::model::{train_snapshot, InMemoryModelStore, TrainingParams};
use chain_anomaly_pipeline::queue::TransactionQueue;
use chain_anomaly_pipeline::retrain::{RetrainOptions, RetrainReason, RetrainingLoop};
use chain_anomaly_pipeline::scoring::{ActiveModel, ScoringEngine};
use chain_anomaly_pipeline::sink::AlertSink;
use chain_anomaly_pipeline::store::{FeatureStore, InMemoryFeatureStore};
use chain_anomaly_pipeline::types::{AlertEvent, FeatureVector, TransactionRecord};
use chrono::{TimeZone, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const WHALE_THRESHOLD: u64 = 1_000_000_000;
const OUTLIER_INDICES: [usize; 5] = [100, 300, 500, 700, 900];

/// Deterministic synthetic feed payload for index `i`. Outlier indices get
/// feature magnitudes far beyond the normal population.
fn feed_payload(i: usize) -> String {
    let time = 1_700_000_000 + (i as i64) * 3;

    if OUTLIER_INDICES.contains(&i) {
        // Extreme in every dimension: value, fee, and fan-out.
        let outputs: Vec<String> = (0..120)
            .map(|k| format!(r#"{{"addr":"1Out{i}_{k}","value":8000000000}}"#))
            .collect();
        let inputs: Vec<String> = (0..80)
            .map(|k| format!(r#"{{"prev_out":{{"addr":"1In{i}_{k}","value":12000000000}}}}"#))
            .collect();
        format!(
            r#"{{"op":"utx","x":{{"hash":"outlier{i}","time":{time},"fee":50000000000,"inputs":[{}],"out":[{}]}}}}"#,
            inputs.join(","),
            outputs.join(",")
        )
    } else {
        let value = 10_000 + (i * 7919) % 190_000;
        let fee = 200 + (i * 131) % 1_800;
        let addr = i % 97;
        format!(
            r#"{{"op":"utx","x":{{"hash":"tx{i:06}","time":{time},"fee":{fee},"inputs":[{{"prev_out":{{"addr":"1Src{addr}","value":{value}}}}}],"out":[{{"addr":"1Dst{addr}","value":{value}}}]}}}}"#
        )
    }
}

#[tokio::test]
async fn test_outliers_flagged_with_low_false_positive_rate() {
    let queue = Arc::new(TransactionQueue::new(2_000));
    let metrics = Arc::new(PipelineMetrics::new());
    let ingestion = IngestionClient::new(
        IngestionOptions {
            url: "nats://unused:4222".to_string(),
            subject: "transactions".to_string(),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(60),
            failure_threshold: 10,
        },
        queue.clone(),
        metrics.clone(),
    );

    // Ingestion: decode 1000 feed messages into the boundary.
    for i in 0..1_000 {
        ingestion.handle_payload(feed_payload(i).as_bytes());
    }
    assert_eq!(queue.depth(), 1_000);
    assert_eq!(queue.dropped_total(), 0);

    // Extraction: drain the boundary in arrival order.
    let extractor = FeatureExtractor::new(chrono::Duration::hours(1), 10_000);
    let mut processed: Vec<(TransactionRecord, FeatureVector)> = Vec::with_capacity(1_000);
    while let Some(record) = queue.try_pop() {
        let features = extractor.process(&record);
        processed.push((record, features));
    }
    assert_eq!(processed.len(), 1_000);

    // Reference model trained on the normal population only.
    let outlier_ids: HashSet<String> = OUTLIER_INDICES
        .iter()
        .map(|i| format!("outlier{i}"))
        .collect();
    let normals: Vec<FeatureVector> = processed
        .iter()
        .filter(|(record, _)| !outlier_ids.contains(&record.id))
        .map(|(_, features)| features.clone())
        .collect();
    assert_eq!(normals.len(), 995);

    let window = (
        Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        Utc.timestamp_opt(1_700_003_000, 0).unwrap(),
    );
    let params = TrainingParams {
        // Calibrate the threshold tighter than the 2% acceptance bound.
        target_anomaly_rate: 0.005,
        ..TrainingParams::default()
    };
    let snapshot = train_snapshot(&normals, &params, 1, window).unwrap();

    let engine = ScoringEngine::new(WHALE_THRESHOLD);
    engine.install(ActiveModel::from_snapshot(snapshot));

    // Scoring: every event scored by exactly the installed version.
    let mut flagged: HashSet<String> = HashSet::new();
    let mut false_positives = 0usize;
    let mut whales = 0usize;

    for (record, features) in &processed {
        let evaluation = engine.evaluate(record, features);
        let result = evaluation.result.expect("model is active");
        assert_eq!(result.model_version, 1);

        if result.is_anomaly {
            if outlier_ids.contains(&record.id) {
                flagged.insert(record.id.clone());
            } else {
                false_positives += 1;
            }
        }
        if evaluation.whale.is_some() {
            whales += 1;
        }
    }

    // All five outliers flagged.
    assert_eq!(
        flagged.len(),
        5,
        "expected all outliers flagged, got {flagged:?}"
    );

    // False-positive rate among the 995 normal transactions below 2%.
    let fpr = false_positives as f64 / 995.0;
    assert!(
        fpr < 0.02,
        "false positive rate {fpr:.4} exceeds bound ({false_positives} events)"
    );

    // The outliers are also whales (value far above the threshold), and the
    // whale rule fired independently of the model.
    assert_eq!(whales, 5);
}

struct NullSink;

#[async_trait::async_trait]
impl AlertSink for NullSink {
    async fn notify(&self, _event: &AlertEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

fn write_features(store: &InMemoryFeatureStore, prefix: &str, n: usize, offset_secs: i64, scale: f64) {
    let base = Utc::now() + chrono::Duration::seconds(offset_secs);
    for i in 0..n {
        let v = scale * (25_000.0 + (i % 80) as f64 * 250.0);
        let fv = FeatureVector::new(
            format!("{prefix}{i}"),
            vec![
                v,
                scale * (400.0 + (i % 9) as f64 * 40.0),
                (1 + i % 3) as f64,
                (1 + i % 4) as f64,
                0.015,
                (i % 5) as f64,
                v * (i % 5) as f64,
                v,
            ],
            base + chrono::Duration::seconds(i as i64),
        );
        store.write(&fv).unwrap();
    }
}

#[tokio::test]
async fn test_distribution_shift_forces_retraining() {
    let features = Arc::new(InMemoryFeatureStore::new(100_000));
    let engine = Arc::new(ScoringEngine::new(WHALE_THRESHOLD));
    let metrics = Arc::new(PipelineMetrics::new());

    let options = RetrainOptions {
        drift_window: chrono::Duration::minutes(15),
        drift_threshold: 0.2,
        ..RetrainOptions::default()
    };
    let (mut retraining, _handle) = RetrainingLoop::new(
        features.clone(),
        Arc::new(InMemoryModelStore::new()),
        engine.clone(),
        Arc::new(NullSink),
        metrics.clone(),
        options,
    );

    // Baseline traffic, older than the drift window, trains the first model.
    write_features(&features, "base", 400, -2_400, 1.0);
    retraining.run_cycle(RetrainReason::Schedule).await;
    assert_eq!(engine.active_version(), Some(1));

    // In-distribution recent traffic: no drift.
    write_features(&features, "steady", 160, -600, 1.0);
    let report = retraining.check_drift(Utc::now()).expect("drift measurable");
    assert!(!report.exceeded, "psi {} unexpectedly high", report.current_value);

    // Shift the recent window far beyond the trained distribution.
    write_features(&features, "shifted", 200, -300, 50.0);
    let report = retraining.check_drift(Utc::now()).expect("drift measurable");
    assert!(
        report.exceeded,
        "psi {} did not exceed threshold",
        report.current_value
    );
    assert!(metrics.last_drift_score() > 0.2);

    // The drift signal forces an off-schedule cycle that promotes a new
    // model trained on the shifted window.
    retraining.run_cycle(RetrainReason::Drift).await;
    assert_eq!(engine.active_version(), Some(2));

    let last = retraining.last_drift_report().expect("report recorded");
    assert_eq!(last.metric_name, "population_stability_index");
}
