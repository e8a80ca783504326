//! Anomaly Detection Pipeline - Main Entry Point
//!
//! Wires the long-lived components together: feed ingestion into the
//! buffering boundary, the scoring consumption loop, the retraining loop
//! with its scheduler trigger, and the periodic metrics reporter.

use anyhow::Result;
use chain_anomaly_pipeline::{
    config::AppConfig,
    extractor::FeatureExtractor,
    ingest::{IngestionClient, IngestionOptions},
    metrics::{MetricsReporter, PipelineMetrics},
    model::store::{load_latest, FsModelStore},
    model::{ForestParams, TrainingParams},
    pipeline::{Pipeline, PipelineOptions},
    queue::TransactionQueue,
    retrain::{RetrainHandle, RetrainOptions, RetrainingLoop},
    scoring::{ActiveModel, ScoringEngine},
    sink::{AlertSink, NatsAlertSink, RetryingSink},
    store::InMemoryFeatureStore,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chain_anomaly_pipeline=info".parse()?),
        )
        .init();

    info!("Starting Anomaly Detection Pipeline");

    // Load configuration
    let config = AppConfig::load()?;
    info!(
        whale_threshold_sats = config.detection.whale_threshold_sats,
        queue_capacity = config.queue.capacity,
        "Configuration loaded successfully"
    );

    // Initialize metrics
    let metrics = Arc::new(PipelineMetrics::new());

    // Buffering boundary between ingestion and scoring
    let queue = Arc::new(TransactionQueue::new(config.queue.capacity));

    // Feature extractor with rolling per-address state
    let extractor = Arc::new(FeatureExtractor::new(
        chrono::Duration::seconds(config.features.rolling_window_secs),
        config.features.max_tracked_addresses,
    ));
    info!(
        features = extractor.feature_count(),
        window_secs = config.features.rolling_window_secs,
        "Feature extractor initialized"
    );

    // Stores
    let feature_store = Arc::new(InMemoryFeatureStore::new(config.features.feature_retention));
    let model_store = Arc::new(FsModelStore::new(&config.retraining.models_dir)?);

    // Scoring engine, recovering the latest persisted model if present
    let engine = Arc::new(ScoringEngine::new(config.detection.whale_threshold_sats));
    match load_latest(model_store.as_ref())? {
        Some(snapshot) => {
            let version = snapshot.version;
            engine.install(ActiveModel::from_snapshot(snapshot));
            metrics.set_active_model_version(version);
            info!(version, "Recovered persisted model, engine ready");
        }
        None => {
            warn!("No persisted model found, starting degraded (whale-only)");
        }
    }

    // Alert sink with bounded local retries
    let nats = async_nats::connect(&config.nats.url).await?;
    info!(url = %config.nats.url, "Connected to NATS");
    let sink: Arc<dyn AlertSink> = Arc::new(RetryingSink::new(
        Arc::new(NatsAlertSink::new(nats.clone(), &config.nats.alert_subject)),
        config.detection.alert_retry_capacity,
    ));

    // Ingestion client task (own connection, so it reconnects independently)
    let ingestion = Arc::new(IngestionClient::new(
        IngestionOptions {
            url: config.nats.url.clone(),
            subject: config.nats.transaction_subject.clone(),
            reconnect_base: Duration::from_millis(config.ingestion.reconnect_base_ms),
            reconnect_cap: Duration::from_millis(config.ingestion.reconnect_cap_ms),
            failure_threshold: config.ingestion.failure_threshold,
        },
        queue.clone(),
        metrics.clone(),
    ));
    tokio::spawn(ingestion.clone().run());

    // Retraining loop and its scheduler trigger
    let retrain_options = RetrainOptions {
        interval: Duration::from_secs(config.retraining.interval_secs),
        drift_check_interval: Duration::from_secs(config.retraining.drift_check_interval_secs),
        training_window: chrono::Duration::seconds(config.retraining.training_window_secs),
        drift_window: chrono::Duration::seconds(config.retraining.drift_window_secs),
        min_samples: config.retraining.min_samples,
        drift_threshold: config.retraining.drift_threshold,
        min_quality: config.retraining.min_quality,
        improvement_margin: config.retraining.improvement_margin,
        retain_generations: config.retraining.retain_generations,
        training: TrainingParams {
            forest: ForestParams {
                trees: config.retraining.trees,
                sample_size: config.retraining.sample_size,
                seed: config.retraining.seed,
            },
            holdout_fraction: config.retraining.holdout_fraction,
            target_anomaly_rate: config.retraining.target_anomaly_rate,
            drift_bins: config.retraining.drift_bins,
        },
    };
    let (retraining, retrain_handle) = RetrainingLoop::new(
        feature_store.clone(),
        model_store,
        engine.clone(),
        sink.clone(),
        metrics.clone(),
        retrain_options,
    );
    tokio::spawn(retraining.run());

    // Forward external scheduler triggers from the control subject
    tokio::spawn(control_listener(
        nats.clone(),
        config.nats.control_subject.clone(),
        retrain_handle,
    ));

    // Metrics reporter (prints a summary every 30 seconds)
    let metrics_clone = metrics.clone();
    tokio::spawn(async move {
        let reporter = MetricsReporter::new(metrics_clone, 30);
        reporter.start().await;
    });

    // Scoring consumption loop
    let pipeline = Pipeline::new(
        queue,
        extractor,
        engine,
        feature_store,
        sink,
        metrics.clone(),
        PipelineOptions {
            pop_timeout: Duration::from_millis(config.queue.pop_timeout_ms),
            seen_ids_capacity: config.detection.seen_ids_capacity,
        },
    );
    tokio::spawn(pipeline.run());

    info!(
        transaction_subject = %config.nats.transaction_subject,
        alert_subject = %config.nats.alert_subject,
        control_subject = %config.nats.control_subject,
        "Pipeline running"
    );

    tokio::signal::ctrl_c().await?;
    info!("Pipeline shutting down...");
    metrics.print_summary();

    Ok(())
}

/// Listen on the control subject and forward retrain triggers. The payload
/// is a free-form reason string.
async fn control_listener(
    client: async_nats::Client,
    subject: String,
    handle: RetrainHandle,
) {
    let mut subscription = match client.subscribe(subject.clone()).await {
        Ok(sub) => sub,
        Err(e) => {
            warn!(error = %e, subject = %subject, "Failed to subscribe to control subject");
            return;
        }
    };
    info!(subject = %subject, "Listening for retrain triggers");

    while let Some(message) = subscription.next().await {
        let reason = String::from_utf8_lossy(&message.payload).trim().to_string();
        let reason = if reason.is_empty() {
            "scheduler".to_string()
        } else {
            reason
        };

        if handle.trigger_retrain(reason.clone()) {
            info!(reason = %reason, "Retrain trigger accepted");
        } else {
            warn!(reason = %reason, "Retrain trigger dropped, cycle already pending");
        }
    }
}
