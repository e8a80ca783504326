//! Alert and scoring outcome data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of scoring one feature vector against the active model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreResult {
    /// Associated transaction ID.
    pub transaction_id: String,

    /// Anomaly score in `[0, 1]`, higher means more anomalous.
    pub anomaly_score: f64,

    /// Whether the score exceeded the model's decision threshold.
    pub is_anomaly: bool,

    /// Version of the model snapshot that produced the score. Always a
    /// snapshot that was active at `scored_at`.
    pub model_version: u64,

    /// Scoring timestamp.
    pub scored_at: DateTime<Utc>,
}

/// Alert generated when the active model flags a transaction as anomalous.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyEvent {
    /// Unique alert identifier.
    pub alert_id: String,

    /// Associated transaction ID.
    pub transaction_id: String,

    /// Anomaly score that triggered the alert.
    pub anomaly_score: f64,

    /// Decision threshold of the model at detection time.
    pub decision_threshold: f64,

    /// Model snapshot version that flagged the transaction.
    pub model_version: u64,

    /// Detection timestamp.
    pub detected_at: DateTime<Utc>,
}

impl AnomalyEvent {
    pub fn from_score(result: &ScoreResult, decision_threshold: f64) -> Self {
        Self {
            alert_id: uuid::Uuid::new_v4().to_string(),
            transaction_id: result.transaction_id.clone(),
            anomaly_score: result.anomaly_score,
            decision_threshold,
            model_version: result.model_version,
            detected_at: result.scored_at,
        }
    }
}

/// Deterministic large-value flag, independent of any model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhaleEvent {
    /// Unique alert identifier.
    pub alert_id: String,

    /// Associated transaction ID.
    pub transaction_id: String,

    /// Transaction value in satoshis.
    pub value: u64,

    /// Threshold in effect at detection time; never retroactively altered.
    pub threshold_used: u64,

    /// Detection timestamp.
    pub detected_at: DateTime<Utc>,
}

impl WhaleEvent {
    pub fn new(transaction_id: impl Into<String>, value: u64, threshold_used: u64) -> Self {
        Self {
            alert_id: uuid::Uuid::new_v4().to_string(),
            transaction_id: transaction_id.into(),
            value,
            threshold_used,
            detected_at: Utc::now(),
        }
    }
}

/// Operator-facing alert for conditions outside the per-transaction path,
/// e.g. a rejected candidate model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationalAlert {
    pub alert_id: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl OperationalAlert {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            alert_id: uuid::Uuid::new_v4().to_string(),
            message: message.into(),
            raised_at: Utc::now(),
        }
    }
}

/// Envelope published to the alert sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertEvent {
    Anomaly(AnomalyEvent),
    Whale(WhaleEvent),
    Operational(OperationalAlert),
}

impl AlertEvent {
    /// Stable label for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AlertEvent::Anomaly(_) => "anomaly",
            AlertEvent::Whale(_) => "whale",
            AlertEvent::Operational(_) => "operational",
        }
    }
}
