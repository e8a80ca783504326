//! Blockchain Anomaly Detection Pipeline
//!
//! Real-time scoring of blockchain transactions for anomalous and whale
//! behavior, with a drift-aware retraining loop that hot-swaps the active
//! model while scoring continues.

pub mod config;
pub mod drift;
pub mod extractor;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod retrain;
pub mod scoring;
pub mod sink;
pub mod store;
pub mod types;

pub use config::AppConfig;
pub use extractor::FeatureExtractor;
pub use ingest::{IngestionClient, IngestionStatus};
pub use pipeline::Pipeline;
pub use queue::TransactionQueue;
pub use retrain::{RetrainHandle, RetrainingLoop};
pub use scoring::{EngineStatus, ScoringEngine};
pub use types::{AlertEvent, FeatureVector, TransactionRecord, WhaleEvent};
