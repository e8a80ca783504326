//! Scoring engine: holds the active model, applies the deterministic whale
//! rule, and exposes the atomic model-swap used by promotion.
//!
//! The active model lives behind a single `Arc` slot. Scoring clones the
//! `Arc` once per event, so a concurrent swap can never expose a partially
//! updated model and every result names exactly one snapshot version.

use crate::model::{ModelSnapshot, Scorer};
use crate::types::{ScoreResult, TransactionRecord, WhaleEvent};
use crate::types::feature::FeatureVector;
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

/// A fully built model ready to serve: snapshot metadata plus the
/// materialized scorer.
pub struct ActiveModel {
    pub snapshot: ModelSnapshot,
    pub scorer: Arc<dyn Scorer>,
}

impl ActiveModel {
    pub fn from_snapshot(snapshot: ModelSnapshot) -> Self {
        let scorer = snapshot.scorer();
        Self { snapshot, scorer }
    }
}

/// Engine health as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// A model is loaded and scoring.
    Ready,
    /// No model loaded; whale detection still works, model scoring is
    /// skipped.
    Degraded,
}

/// Outcome of evaluating one transaction.
#[derive(Debug, Default)]
pub struct Evaluation {
    /// Model scoring outcome; `None` when degraded or on a scoring error.
    pub result: Option<ScoreResult>,
    /// Decision threshold of the model that produced `result`.
    pub decision_threshold: Option<f64>,
    /// Whale flag, produced independently of the model.
    pub whale: Option<WhaleEvent>,
    /// Per-event scoring error, caught rather than propagated.
    pub error: Option<String>,
}

pub struct ScoringEngine {
    active: RwLock<Option<Arc<ActiveModel>>>,
    whale_threshold: u64,
}

impl ScoringEngine {
    /// Create an engine with no model loaded (degraded, whale-only).
    pub fn new(whale_threshold: u64) -> Self {
        Self {
            active: RwLock::new(None),
            whale_threshold,
        }
    }

    /// Atomically publish a new active model. The swap is a single pointer
    /// replace; in-flight scoring keeps the `Arc` it already cloned.
    pub fn install(&self, model: ActiveModel) {
        let version = model.snapshot.version;
        *self.active.write() = Some(Arc::new(model));
        info!(version, "Active model installed");
    }

    /// Current active model, if any.
    pub fn active(&self) -> Option<Arc<ActiveModel>> {
        self.active.read().clone()
    }

    pub fn active_version(&self) -> Option<u64> {
        self.active.read().as_ref().map(|m| m.snapshot.version)
    }

    pub fn status(&self) -> EngineStatus {
        if self.active.read().is_some() {
            EngineStatus::Ready
        } else {
            EngineStatus::Degraded
        }
    }

    pub fn whale_threshold(&self) -> u64 {
        self.whale_threshold
    }

    /// Evaluate one transaction: whale rule first (model-independent), then
    /// model scoring against the captured active model. Scoring errors are
    /// caught and reported in the outcome, never propagated.
    pub fn evaluate(&self, record: &TransactionRecord, features: &FeatureVector) -> Evaluation {
        let mut evaluation = Evaluation::default();

        if record.total_value >= self.whale_threshold {
            evaluation.whale = Some(WhaleEvent::new(
                record.id.clone(),
                record.total_value,
                self.whale_threshold,
            ));
        }

        // Capture the model once; a swap after this line does not affect
        // this event.
        let Some(model) = self.active() else {
            debug!(transaction_id = %record.id, "No active model, whale-only evaluation");
            return evaluation;
        };

        match model.scorer.score(&features.values) {
            Ok(anomaly_score) => {
                evaluation.result = Some(ScoreResult {
                    transaction_id: record.id.clone(),
                    anomaly_score,
                    is_anomaly: anomaly_score > model.snapshot.decision_threshold,
                    model_version: model.snapshot.version,
                    scored_at: Utc::now(),
                });
                evaluation.decision_threshold = Some(model.snapshot.decision_threshold);
            }
            Err(e) => {
                evaluation.error = Some(e.to_string());
            }
        }

        evaluation
    }
}
