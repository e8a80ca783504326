//! Configuration management for the anomaly detection pipeline

use anyhow::{Context, Result};
use config::{Config, File};
use serde::Deserialize;
use std::path::Path;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub nats: NatsConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub retraining: RetrainingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// NATS connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,
    /// Subject for the inbound transaction feed
    pub transaction_subject: String,
    /// Subject for outbound alerts
    pub alert_subject: String,
    /// Subject the external scheduler publishes retrain triggers to
    #[serde(default = "default_control_subject")]
    pub control_subject: String,
}

fn default_control_subject() -> String {
    "pipeline.retrain".to_string()
}

/// Ingestion client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IngestionConfig {
    /// Reconnect backoff base in milliseconds
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    /// Reconnect backoff cap in milliseconds
    #[serde(default = "default_reconnect_cap_ms")]
    pub reconnect_cap_ms: u64,
    /// Consecutive failures before ingestion is reported unavailable
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_cap_ms() -> u64 {
    60_000
}

fn default_failure_threshold() -> u32 {
    10
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_cap_ms: default_reconnect_cap_ms(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Buffering boundary configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Maximum queued transactions before drop-oldest kicks in
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// Bounded wait per pop in milliseconds
    #[serde(default = "default_pop_timeout_ms")]
    pub pop_timeout_ms: u64,
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_pop_timeout_ms() -> u64 {
    500
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            pop_timeout_ms: default_pop_timeout_ms(),
        }
    }
}

/// Feature extraction configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FeatureConfig {
    /// Rolling window for per-address aggregates, in seconds
    #[serde(default = "default_rolling_window_secs")]
    pub rolling_window_secs: i64,
    /// Cap on tracked addresses before LRU eviction
    #[serde(default = "default_max_tracked_addresses")]
    pub max_tracked_addresses: usize,
    /// Feature store retention, in vectors
    #[serde(default = "default_feature_retention")]
    pub feature_retention: usize,
}

fn default_rolling_window_secs() -> i64 {
    3_600
}

fn default_max_tracked_addresses() -> usize {
    100_000
}

fn default_feature_retention() -> usize {
    500_000
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            rolling_window_secs: default_rolling_window_secs(),
            max_tracked_addresses: default_max_tracked_addresses(),
            feature_retention: default_feature_retention(),
        }
    }
}

/// Detection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Whale threshold in satoshis (default 10 BTC)
    #[serde(default = "default_whale_threshold_sats")]
    pub whale_threshold_sats: u64,
    /// Capacity of the duplicate-suppression window
    #[serde(default = "default_seen_ids_capacity")]
    pub seen_ids_capacity: usize,
    /// Bounded retry queue for the alert sink
    #[serde(default = "default_alert_retry_capacity")]
    pub alert_retry_capacity: usize,
}

fn default_whale_threshold_sats() -> u64 {
    1_000_000_000
}

fn default_seen_ids_capacity() -> usize {
    100_000
}

fn default_alert_retry_capacity() -> usize {
    256
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            whale_threshold_sats: default_whale_threshold_sats(),
            seen_ids_capacity: default_seen_ids_capacity(),
            alert_retry_capacity: default_alert_retry_capacity(),
        }
    }
}

/// Retraining loop configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetrainingConfig {
    /// Scheduled retraining interval in seconds
    #[serde(default = "default_retrain_interval_secs")]
    pub interval_secs: u64,
    /// Drift check interval in seconds
    #[serde(default = "default_drift_check_interval_secs")]
    pub drift_check_interval_secs: u64,
    /// Historical training window in seconds
    #[serde(default = "default_training_window_secs")]
    pub training_window_secs: i64,
    /// Recent window compared against the baseline, in seconds
    #[serde(default = "default_drift_window_secs")]
    pub drift_window_secs: i64,
    /// Minimum vectors required to train
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// PSI threshold that forces retraining
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: f64,
    /// Absolute quality floor for promotion
    #[serde(default = "default_min_quality")]
    pub min_quality: f64,
    /// Required quality improvement over the active model
    #[serde(default)]
    pub improvement_margin: f64,
    /// Stored snapshot generations kept for rollback
    #[serde(default = "default_retain_generations")]
    pub retain_generations: usize,
    /// Trees in the isolation forest
    #[serde(default = "default_trees")]
    pub trees: usize,
    /// Subsample size per tree
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    /// Training seed for reproducible fits
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Held-out fraction for calibration
    #[serde(default = "default_holdout_fraction")]
    pub holdout_fraction: f64,
    /// Expected anomaly rate used to set the decision threshold
    #[serde(default = "default_target_anomaly_rate")]
    pub target_anomaly_rate: f64,
    /// Bins for the drift baseline histograms
    #[serde(default = "default_drift_bins")]
    pub drift_bins: usize,
    /// Directory for persisted model artifacts
    #[serde(default = "default_models_dir")]
    pub models_dir: String,
}

fn default_retrain_interval_secs() -> u64 {
    6 * 3600
}

fn default_drift_check_interval_secs() -> u64 {
    600
}

fn default_training_window_secs() -> i64 {
    24 * 3600
}

fn default_drift_window_secs() -> i64 {
    3_600
}

fn default_min_samples() -> usize {
    100
}

fn default_drift_threshold() -> f64 {
    0.2
}

fn default_min_quality() -> f64 {
    0.5
}

fn default_retain_generations() -> usize {
    3
}

fn default_trees() -> usize {
    100
}

fn default_sample_size() -> usize {
    256
}

fn default_seed() -> u64 {
    42
}

fn default_holdout_fraction() -> f64 {
    0.2
}

fn default_target_anomaly_rate() -> f64 {
    0.01
}

fn default_drift_bins() -> usize {
    10
}

fn default_models_dir() -> String {
    "models".to_string()
}

impl Default for RetrainingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_retrain_interval_secs(),
            drift_check_interval_secs: default_drift_check_interval_secs(),
            training_window_secs: default_training_window_secs(),
            drift_window_secs: default_drift_window_secs(),
            min_samples: default_min_samples(),
            drift_threshold: default_drift_threshold(),
            min_quality: default_min_quality(),
            improvement_margin: 0.0,
            retain_generations: default_retain_generations(),
            trees: default_trees(),
            sample_size: default_sample_size(),
            seed: default_seed(),
            holdout_fraction: default_holdout_fraction(),
            target_anomaly_rate: default_target_anomaly_rate(),
            drift_bins: default_drift_bins(),
            models_dir: default_models_dir(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn load() -> Result<Self> {
        Self::load_from_path("config/config.toml")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            nats: NatsConfig {
                url: "nats://localhost:4222".to_string(),
                transaction_subject: "transactions".to_string(),
                alert_subject: "pipeline.alerts".to_string(),
                control_subject: default_control_subject(),
            },
            ingestion: IngestionConfig::default(),
            queue: QueueConfig::default(),
            features: FeatureConfig::default(),
            detection: DetectionConfig::default(),
            retraining: RetrainingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.nats.url, "nats://localhost:4222");
        assert_eq!(config.detection.whale_threshold_sats, 1_000_000_000);
        assert_eq!(config.retraining.seed, 42);
        assert_eq!(config.queue.capacity, 10_000);
        assert_eq!(config.ingestion.failure_threshold, 10);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[nats]
url = "nats://example:4222"
transaction_subject = "tx"
alert_subject = "alerts"

[detection]
whale_threshold_sats = 500
"#,
        )
        .unwrap();

        let config = AppConfig::load_from_path(&path).unwrap();
        assert_eq!(config.nats.url, "nats://example:4222");
        assert_eq!(config.detection.whale_threshold_sats, 500);
        // Unspecified sections fall back to defaults.
        assert_eq!(config.queue.capacity, 10_000);
        assert_eq!(config.retraining.drift_threshold, 0.2);
    }
}
