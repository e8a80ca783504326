//! Distribution-shift measurement between the training-time baseline and a
//! recent feature window.
//!
//! The metric is a population-stability index: each feature gets quantile
//! bins from the training sample, recent observations are bucketed into the
//! same bins, and the divergence of the bucket proportions is averaged
//! across features.

use crate::types::feature::{FeatureVector, FEATURE_COUNT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Floor applied to bucket proportions so empty buckets do not blow up the
/// log term.
const PROPORTION_FLOOR: f64 = 1e-4;

/// Result of one drift check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
    /// Observation window the check ran over.
    pub window: (DateTime<Utc>, DateTime<Utc>),

    /// Name of the statistic.
    pub metric_name: String,

    /// Statistic value at the baseline (zero by construction for a freshly
    /// promoted model).
    pub baseline_value: f64,

    /// Statistic value measured over the current window.
    pub current_value: f64,

    /// Whether the configured threshold was exceeded.
    pub exceeded: bool,
}

/// One feature's baseline histogram: strictly increasing interior bin edges
/// plus the bucket proportions measured on the training window. Duplicate
/// quantiles collapse into one edge, so skewed columns (lots of zeros) do
/// not fabricate drift.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FeatureBins {
    edges: Vec<f64>,
    expected: Vec<f64>,
}

impl FeatureBins {
    fn bucket(&self, value: f64) -> usize {
        self.edges.iter().filter(|e| value > **e).count()
    }
}

/// Per-feature quantile histograms captured from the training window.
/// Stored inside the model snapshot so drift is always measured against the
/// distribution the active model was trained on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureBaseline {
    features: Vec<FeatureBins>,
}

impl FeatureBaseline {
    /// Capture quantile histograms from a training matrix.
    pub fn from_matrix(rows: &[Vec<f64>], bins: usize) -> Self {
        let bins = bins.max(2);
        let mut features = Vec::with_capacity(FEATURE_COUNT);

        for feature in 0..FEATURE_COUNT {
            let mut column: Vec<f64> = rows
                .iter()
                .filter_map(|r| r.get(feature).copied())
                .filter(|v| v.is_finite())
                .collect();
            column.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

            let mut edges: Vec<f64> = Vec::with_capacity(bins - 1);
            if !column.is_empty() {
                for b in 1..bins {
                    let q = b as f64 / bins as f64;
                    let idx = ((column.len() - 1) as f64 * q).round() as usize;
                    let edge = column[idx];
                    if edges.last().map_or(true, |last| edge > *last) {
                        edges.push(edge);
                    }
                }
            }

            let bins = FeatureBins {
                expected: measure_proportions(&edges, column.iter().copied()),
                edges,
            };
            features.push(bins);
        }

        Self { features }
    }

    /// Population-stability index of `current` against this baseline,
    /// averaged over features. Returns 0.0 when the window is empty.
    pub fn psi(&self, current: &[FeatureVector]) -> f64 {
        if current.is_empty() {
            return 0.0;
        }

        let mut total = 0.0;
        let mut measured_features = 0;

        for (feature, bins) in self.features.iter().enumerate() {
            // Constant training columns carry no drift signal.
            if bins.edges.is_empty() {
                continue;
            }

            let actual = measure_proportions(
                &bins.edges,
                current
                    .iter()
                    .filter_map(|fv| fv.values.get(feature).copied())
                    .filter(|v| v.is_finite()),
            );
            if actual.is_empty() {
                continue;
            }

            let mut psi = 0.0;
            for (a, e) in actual.iter().zip(bins.expected.iter()) {
                let a = a.max(PROPORTION_FLOOR);
                let e = e.max(PROPORTION_FLOOR);
                psi += (a - e) * (a / e).ln();
            }

            total += psi;
            measured_features += 1;
        }

        if measured_features > 0 {
            total / measured_features as f64
        } else {
            0.0
        }
    }

    /// Build a drift report for `current` against this baseline.
    pub fn check(
        &self,
        current: &[FeatureVector],
        window: (DateTime<Utc>, DateTime<Utc>),
        threshold: f64,
    ) -> DriftReport {
        let value = self.psi(current);
        DriftReport {
            window,
            metric_name: "population_stability_index".to_string(),
            baseline_value: 0.0,
            current_value: value,
            exceeded: value > threshold,
        }
    }
}

/// Bucket proportions of `values` against interior `edges`. Empty input
/// yields an empty vector so callers can skip the feature.
fn measure_proportions(edges: &[f64], values: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut counts = vec![0usize; edges.len() + 1];
    let mut n = 0usize;
    for value in values {
        let bucket = edges.iter().filter(|e| value > **e).count();
        counts[bucket] += 1;
        n += 1;
    }
    if n == 0 {
        return Vec::new();
    }
    counts.into_iter().map(|c| c as f64 / n as f64).collect()
}
