//! Feature vector representation shared by scoring and training.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of features produced per transaction. Models are trained and
/// scored against exactly this shape.
pub const FEATURE_COUNT: usize = 8;

/// Feature names in vector order.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "total_value",
    "fee",
    "input_count",
    "output_count",
    "fee_ratio",
    "addr_window_tx_count",
    "addr_window_total_value",
    "addr_window_mean_value",
];

/// Fixed-shape numeric representation of one transaction, derived from the
/// record plus the rolling state at extraction time. Recomputation for the
/// same transaction id overwrites the stored vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureVector {
    pub transaction_id: String,
    pub values: Vec<f64>,
    pub extracted_at: DateTime<Utc>,
}

impl FeatureVector {
    pub fn new(transaction_id: impl Into<String>, values: Vec<f64>, extracted_at: DateTime<Utc>) -> Self {
        debug_assert_eq!(values.len(), FEATURE_COUNT);
        Self {
            transaction_id: transaction_id.into(),
            values,
            extracted_at,
        }
    }
}
