//! Type definitions for the anomaly detection pipeline

pub mod alert;
pub mod feature;
pub mod transaction;

pub use alert::{AlertEvent, AnomalyEvent, OperationalAlert, ScoreResult, WhaleEvent};
pub use feature::{FeatureVector, FEATURE_COUNT, FEATURE_NAMES};
pub use transaction::{decode_feed_message, FeedDecodeError, FeedMessage, TransactionRecord};
