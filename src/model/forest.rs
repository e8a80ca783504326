//! Isolation-forest scorer: the default partition-based anomaly model.
//!
//! Anomalous points isolate in fewer random splits than normal points, so
//! the average path length over an ensemble of random trees converts into
//! an anomaly score in `(0, 1)` where higher means more anomalous.

use crate::model::Scorer;
use crate::types::feature::FEATURE_COUNT;
use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Euler-Mascheroni constant, used in the average path length estimate.
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Training parameters for the forest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestParams {
    /// Number of trees in the ensemble.
    pub trees: usize,
    /// Subsample size per tree.
    pub sample_size: usize,
    /// Seed for reproducible training.
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            trees: 100,
            sample_size: 256,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

/// A trained isolation forest. Serializable so snapshots can persist the
/// full model as a versioned artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<Node>,
    sample_size: usize,
}

impl IsolationForest {
    /// Fit a forest on a feature matrix. Every row must have
    /// [`FEATURE_COUNT`] columns.
    pub fn fit(rows: &[Vec<f64>], params: &ForestParams) -> Result<Self> {
        if rows.is_empty() {
            bail!("cannot fit on an empty training set");
        }
        if let Some(bad) = rows.iter().find(|r| r.len() != FEATURE_COUNT) {
            bail!(
                "training row has {} features, expected {}",
                bad.len(),
                FEATURE_COUNT
            );
        }
        if params.trees == 0 || params.sample_size < 2 {
            bail!("forest parameters out of range");
        }

        let mut rng = StdRng::seed_from_u64(params.seed);
        let sample_size = params.sample_size.min(rows.len());
        let max_depth = (sample_size as f64).log2().ceil() as usize;

        let trees = (0..params.trees)
            .map(|_| {
                let mut indices =
                    rand::seq::index::sample(&mut rng, rows.len(), sample_size).into_vec();
                build_node(rows, &mut indices, 0, max_depth, &mut rng)
            })
            .collect();

        Ok(Self { trees, sample_size })
    }

    /// Average path length of `values` across the ensemble.
    fn mean_path_length(&self, values: &[f64]) -> f64 {
        let total: f64 = self
            .trees
            .iter()
            .map(|tree| path_length(tree, values, 0))
            .sum();
        total / self.trees.len() as f64
    }
}

impl Scorer for IsolationForest {
    fn score(&self, values: &[f64]) -> Result<f64> {
        if values.len() != FEATURE_COUNT {
            bail!(
                "feature vector has {} values, model expects {}",
                values.len(),
                FEATURE_COUNT
            );
        }

        let mean_path = self.mean_path_length(values);
        let normalizer = average_path_length(self.sample_size);
        Ok((2.0_f64).powf(-mean_path / normalizer))
    }
}

fn build_node(
    rows: &[Vec<f64>],
    indices: &mut [usize],
    depth: usize,
    max_depth: usize,
    rng: &mut StdRng,
) -> Node {
    if indices.len() <= 1 || depth >= max_depth {
        return Node::Leaf {
            size: indices.len(),
        };
    }

    // Only features with spread inside this partition can split it.
    let mut candidates = Vec::with_capacity(FEATURE_COUNT);
    for feature in 0..FEATURE_COUNT {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &i in indices.iter() {
            let v = rows[i][feature];
            min = min.min(v);
            max = max.max(v);
        }
        if min < max {
            candidates.push((feature, min, max));
        }
    }

    let Some(&(feature, min, max)) = candidates.get(rng.gen_range(0..candidates.len().max(1)))
    else {
        return Node::Leaf {
            size: indices.len(),
        };
    };

    let threshold = rng.gen_range(min..max);
    let split_at = partition(rows, indices, feature, threshold);
    if split_at == 0 || split_at == indices.len() {
        return Node::Leaf {
            size: indices.len(),
        };
    }

    let (left_idx, right_idx) = indices.split_at_mut(split_at);
    let left = build_node(rows, left_idx, depth + 1, max_depth, rng);
    let right = build_node(rows, right_idx, depth + 1, max_depth, rng);

    Node::Split {
        feature,
        threshold,
        left: Box::new(left),
        right: Box::new(right),
    }
}

/// In-place partition of `indices` by `rows[i][feature] < threshold`;
/// returns the size of the left side.
fn partition(rows: &[Vec<f64>], indices: &mut [usize], feature: usize, threshold: f64) -> usize {
    let mut left = 0;
    for i in 0..indices.len() {
        if rows[indices[i]][feature] < threshold {
            indices.swap(left, i);
            left += 1;
        }
    }
    left
}

fn path_length(node: &Node, values: &[f64], depth: usize) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + average_path_length(*size),
        Node::Split {
            feature,
            threshold,
            left,
            right,
        } => {
            if values[*feature] < *threshold {
                path_length(left, values, depth + 1)
            } else {
                path_length(right, values, depth + 1)
            }
        }
    }
}

/// Expected path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        n => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normal_row(i: usize) -> Vec<f64> {
        // Deterministic spread around typical transaction magnitudes.
        let v = 40_000.0 + (i % 100) as f64 * 200.0;
        vec![
            v,
            500.0 + (i % 10) as f64 * 50.0,
            (1 + i % 3) as f64,
            (1 + i % 4) as f64,
            0.01,
            (i % 5) as f64,
            v * (i % 5) as f64,
            v,
        ]
    }

    fn train_forest() -> IsolationForest {
        let rows: Vec<Vec<f64>> = (0..600).map(normal_row).collect();
        IsolationForest::fit(&rows, &ForestParams::default()).unwrap()
    }

    #[test]
    fn test_outlier_scores_above_population() {
        let forest = train_forest();

        let typical = forest.score(&normal_row(17)).unwrap();
        let outlier_row = vec![
            5_000_000_000.0,
            2_000_000.0,
            80.0,
            90.0,
            0.5,
            200.0,
            1e12,
            5e9,
        ];
        let outlier = forest.score(&outlier_row).unwrap();

        assert!(outlier > typical, "outlier {outlier} <= typical {typical}");
        assert!(outlier > 0.6);
        assert!((0.0..=1.0).contains(&typical));
    }

    #[test]
    fn test_fit_is_reproducible_for_same_seed() {
        let rows: Vec<Vec<f64>> = (0..300).map(normal_row).collect();
        let a = IsolationForest::fit(&rows, &ForestParams::default()).unwrap();
        let b = IsolationForest::fit(&rows, &ForestParams::default()).unwrap();

        let probe = normal_row(5);
        assert_eq!(a.score(&probe).unwrap(), b.score(&probe).unwrap());
    }

    #[test]
    fn test_score_rejects_wrong_shape() {
        let forest = train_forest();
        assert!(forest.score(&[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_fit_rejects_empty_input() {
        assert!(IsolationForest::fit(&[], &ForestParams::default()).is_err());
    }

    #[test]
    fn test_artifact_round_trip_preserves_scores() {
        let forest = train_forest();
        let json = serde_json::to_string(&forest).unwrap();
        let restored: IsolationForest = serde_json::from_str(&json).unwrap();

        let probe = normal_row(33);
        assert_eq!(
            forest.score(&probe).unwrap(),
            restored.score(&probe).unwrap()
        );
    }
}
