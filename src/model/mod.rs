//! Model contracts: the pluggable scorer capability, versioned snapshots,
//! and candidate training with held-out calibration.

pub mod forest;
pub mod store;

pub use forest::{ForestParams, IsolationForest};
pub use store::{FsModelStore, InMemoryModelStore, ModelStore};

use crate::drift::FeatureBaseline;
use crate::types::FeatureVector;
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Opaque scoring capability. The engine and the retraining loop only ever
/// see this trait; the concrete algorithm is an implementation detail of
/// the artifact.
pub trait Scorer: Send + Sync {
    /// Anomaly score for one feature vector, in `[0, 1]`, higher means more
    /// anomalous.
    fn score(&self, values: &[f64]) -> Result<f64>;
}

/// Serialized model artifact. An enum rather than a trait object so
/// snapshots stay plain serde values; new algorithms add a variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum ModelArtifact {
    IsolationForest(IsolationForest),
}

impl ModelArtifact {
    /// Materialize the scoring capability from the artifact.
    pub fn scorer(&self) -> Arc<dyn Scorer> {
        match self {
            ModelArtifact::IsolationForest(forest) => Arc::new(forest.clone()),
        }
    }
}

/// Validation metrics computed on the held-out split at training time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub holdout_samples: usize,
    pub mean_score: f64,
    pub std_score: f64,
    /// Fraction of held-out vectors above the decision threshold.
    pub holdout_anomaly_rate: f64,
    /// Quality in `[0, 1]`: how closely the flagged rate tracks the
    /// configured target rate. Used by promotion gating.
    pub quality: f64,
}

/// One trained scorer with everything needed to serve, compare, and audit
/// it: monotonic version, decision threshold, validation metrics, and the
/// drift baseline of its training window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub version: u64,
    pub trained_at: DateTime<Utc>,
    pub training_window: (DateTime<Utc>, DateTime<Utc>),
    pub training_samples: usize,
    pub decision_threshold: f64,
    pub validation: ValidationMetrics,
    pub baseline: FeatureBaseline,
    pub artifact: ModelArtifact,
}

impl ModelSnapshot {
    pub fn scorer(&self) -> Arc<dyn Scorer> {
        self.artifact.scorer()
    }
}

/// Parameters for one training run.
#[derive(Debug, Clone)]
pub struct TrainingParams {
    pub forest: ForestParams,
    /// Fraction of the window held out for calibration and validation.
    pub holdout_fraction: f64,
    /// Expected anomaly rate; sets the decision threshold at the
    /// `1 - target` quantile of held-out scores.
    pub target_anomaly_rate: f64,
    /// Bin count for the drift baseline.
    pub drift_bins: usize,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            forest: ForestParams::default(),
            holdout_fraction: 0.2,
            target_anomaly_rate: 0.01,
            drift_bins: 10,
        }
    }
}

/// Fit a candidate snapshot from a historical feature window.
///
/// The window is shuffled with the seeded rng, split into train and
/// held-out parts, the forest is fitted on the train part, and the decision
/// threshold is calibrated on the held-out scores.
pub fn train_snapshot(
    features: &[FeatureVector],
    params: &TrainingParams,
    version: u64,
    window: (DateTime<Utc>, DateTime<Utc>),
) -> Result<ModelSnapshot> {
    if features.len() < 10 {
        bail!(
            "training window has {} vectors, need at least 10",
            features.len()
        );
    }

    let mut rows: Vec<Vec<f64>> = features.iter().map(|f| f.values.clone()).collect();
    let mut rng = StdRng::seed_from_u64(params.forest.seed);
    rows.shuffle(&mut rng);

    let holdout_len = ((rows.len() as f64 * params.holdout_fraction) as usize)
        .clamp(1, rows.len() - 1);
    let (holdout, train) = rows.split_at(holdout_len);

    let forest = IsolationForest::fit(train, &params.forest)?;

    let mut holdout_scores = holdout
        .iter()
        .map(|row| forest.score(row))
        .collect::<Result<Vec<f64>>>()?;
    holdout_scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let decision_threshold = quantile(&holdout_scores, 1.0 - params.target_anomaly_rate);
    let validation = validate(
        &holdout_scores,
        decision_threshold,
        params.target_anomaly_rate,
    );

    Ok(ModelSnapshot {
        version,
        trained_at: Utc::now(),
        training_window: window,
        training_samples: train.len(),
        decision_threshold,
        validation,
        baseline: FeatureBaseline::from_matrix(train, params.drift_bins),
        artifact: ModelArtifact::IsolationForest(forest),
    })
}

/// Measure a scorer's quality on a held-out matrix: score everything,
/// compare the flagged rate against the target. Used to evaluate the active
/// model on the candidate's held-out split during validation.
pub fn evaluate_quality(
    scorer: &dyn Scorer,
    decision_threshold: f64,
    holdout: &[Vec<f64>],
    target_anomaly_rate: f64,
) -> Result<f64> {
    if holdout.is_empty() {
        return Ok(0.0);
    }
    let mut scores = holdout
        .iter()
        .map(|row| scorer.score(row))
        .collect::<Result<Vec<f64>>>()?;
    scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Ok(validate(&scores, decision_threshold, target_anomaly_rate).quality)
}

/// Rebuild the held-out matrix a snapshot's validation used, for an
/// apples-to-apples comparison between candidate and incumbent.
pub fn holdout_matrix(
    features: &[FeatureVector],
    params: &TrainingParams,
) -> Vec<Vec<f64>> {
    let mut rows: Vec<Vec<f64>> = features.iter().map(|f| f.values.clone()).collect();
    let mut rng = StdRng::seed_from_u64(params.forest.seed);
    rows.shuffle(&mut rng);
    let holdout_len = ((rows.len() as f64 * params.holdout_fraction) as usize)
        .clamp(1, rows.len().saturating_sub(1).max(1));
    rows.truncate(holdout_len);
    rows
}

fn validate(sorted_scores: &[f64], threshold: f64, target_rate: f64) -> ValidationMetrics {
    let n = sorted_scores.len();
    let mean = sorted_scores.iter().sum::<f64>() / n as f64;
    let variance = sorted_scores
        .iter()
        .map(|s| (s - mean).powi(2))
        .sum::<f64>()
        / n as f64;

    let flagged = sorted_scores.iter().filter(|s| **s > threshold).count();
    let rate = flagged as f64 / n as f64;

    let quality = if target_rate > 0.0 {
        (1.0 - ((rate - target_rate).abs() / target_rate)).clamp(0.0, 1.0)
    } else {
        0.0
    };

    ValidationMetrics {
        holdout_samples: n,
        mean_score: mean,
        std_score: variance.sqrt(),
        holdout_anomaly_rate: rate,
        quality,
    }
}

/// Quantile of an already sorted slice, nearest-rank interpolation.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * q.clamp(0.0, 1.0)).round() as usize;
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn feature_window(n: usize) -> Vec<FeatureVector> {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        (0..n)
            .map(|i| {
                let v = 30_000.0 + (i % 120) as f64 * 150.0;
                FeatureVector::new(
                    format!("tx{i}"),
                    vec![
                        v,
                        400.0 + (i % 7) as f64 * 30.0,
                        (1 + i % 3) as f64,
                        (1 + i % 4) as f64,
                        0.012,
                        (i % 6) as f64,
                        v * (i % 6) as f64,
                        v,
                    ],
                    ts,
                )
            })
            .collect()
    }

    fn test_window() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            Utc.timestamp_opt(1_700_003_600, 0).unwrap(),
        )
    }

    #[test]
    fn test_train_snapshot_calibrates_threshold() {
        let features = feature_window(500);
        let snapshot =
            train_snapshot(&features, &TrainingParams::default(), 1, test_window()).unwrap();

        assert_eq!(snapshot.version, 1);
        assert!(snapshot.decision_threshold > 0.0 && snapshot.decision_threshold < 1.0);
        assert_eq!(snapshot.validation.holdout_samples, 100);
        // Threshold at the (1 - target) quantile keeps the held-out flagged
        // rate close to the target.
        assert!(snapshot.validation.holdout_anomaly_rate <= 0.05);
    }

    #[test]
    fn test_train_snapshot_rejects_tiny_windows() {
        let features = feature_window(5);
        assert!(train_snapshot(&features, &TrainingParams::default(), 1, test_window()).is_err());
    }

    #[test]
    fn test_snapshot_artifact_round_trip() {
        let features = feature_window(200);
        let snapshot =
            train_snapshot(&features, &TrainingParams::default(), 7, test_window()).unwrap();

        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: ModelSnapshot = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.version, 7);
        let probe = &features[0].values;
        assert_eq!(
            snapshot.scorer().score(probe).unwrap(),
            restored.scorer().score(probe).unwrap()
        );
    }

    #[test]
    fn test_evaluate_quality_matches_training_validation() {
        let features = feature_window(500);
        let params = TrainingParams::default();
        let snapshot = train_snapshot(&features, &params, 1, test_window()).unwrap();

        let holdout = holdout_matrix(&features, &params);
        let quality = evaluate_quality(
            snapshot.scorer().as_ref(),
            snapshot.decision_threshold,
            &holdout,
            params.target_anomaly_rate,
        )
        .unwrap();

        assert!((quality - snapshot.validation.quality).abs() < 1e-9);
    }

    #[test]
    fn test_quantile_nearest_rank() {
        let sorted = vec![0.1, 0.2, 0.3, 0.4, 0.5];
        assert_eq!(quantile(&sorted, 0.0), 0.1);
        assert_eq!(quantile(&sorted, 1.0), 0.5);
        assert_eq!(quantile(&sorted, 0.5), 0.3);
    }
}
