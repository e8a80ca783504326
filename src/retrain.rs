//! Retraining loop: drift checks, candidate training, validation gating,
//! and atomic promotion into the scoring engine.
//!
//! Cycle states: Idle → DriftCheck → Training → Validating → {Promoting |
//! RolledBack} → Idle. A rejected candidate leaves the active model
//! untouched and raises an operational alert. A trigger arriving mid-cycle
//! supersedes the in-flight run at the next phase boundary.

use crate::drift::DriftReport;
use crate::metrics::PipelineMetrics;
use crate::model::{
    evaluate_quality, holdout_matrix, train_snapshot, ModelStore, TrainingParams,
};
use crate::scoring::{ActiveModel, ScoringEngine};
use crate::sink::AlertSink;
use crate::store::FeatureStore;
use crate::types::{AlertEvent, OperationalAlert};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Minimum recent vectors required before a drift check is meaningful.
const DRIFT_MIN_SAMPLES: usize = 10;

/// Why a retraining cycle ran.
#[derive(Debug, Clone)]
pub enum RetrainReason {
    Schedule,
    Drift,
    External(String),
}

impl fmt::Display for RetrainReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrainReason::Schedule => write!(f, "schedule"),
            RetrainReason::Drift => write!(f, "drift"),
            RetrainReason::External(reason) => write!(f, "external:{reason}"),
        }
    }
}

/// Observable cycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrainState {
    Idle,
    DriftCheck,
    Training,
    Validating,
    Promoting,
    RolledBack,
}

/// Inbound control capability handed to external schedulers.
#[derive(Clone)]
pub struct RetrainHandle {
    tx: mpsc::Sender<RetrainReason>,
}

impl RetrainHandle {
    /// Request an off-schedule retraining cycle. Returns `false` when the
    /// trigger queue is full (a cycle is already pending).
    pub fn trigger_retrain(&self, reason: impl Into<String>) -> bool {
        self.tx
            .try_send(RetrainReason::External(reason.into()))
            .is_ok()
    }
}

/// Configuration for the retraining loop.
#[derive(Debug, Clone)]
pub struct RetrainOptions {
    /// Scheduled retraining interval.
    pub interval: Duration,
    /// Drift check interval, expected to be shorter than `interval`.
    pub drift_check_interval: Duration,
    /// Historical window read for training.
    pub training_window: chrono::Duration,
    /// Recent window compared against the baseline for drift.
    pub drift_window: chrono::Duration,
    /// Minimum training vectors; smaller windows skip the cycle.
    pub min_samples: usize,
    /// PSI value above which drift forces retraining.
    pub drift_threshold: f64,
    /// Absolute quality floor for candidate promotion.
    pub min_quality: f64,
    /// Candidate must beat the active model's quality by this margin.
    pub improvement_margin: f64,
    /// Stored snapshot generations kept for rollback.
    pub retain_generations: usize,
    pub training: TrainingParams,
}

impl Default for RetrainOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(6 * 3600),
            drift_check_interval: Duration::from_secs(600),
            training_window: chrono::Duration::hours(24),
            drift_window: chrono::Duration::hours(1),
            min_samples: 100,
            drift_threshold: 0.2,
            min_quality: 0.5,
            improvement_margin: 0.0,
            retain_generations: 3,
            training: TrainingParams::default(),
        }
    }
}

struct ValidationVerdict {
    passed: bool,
    candidate_quality: f64,
    active_quality: Option<f64>,
    reason: String,
}

pub struct RetrainingLoop {
    features: Arc<dyn FeatureStore>,
    models: Arc<dyn ModelStore>,
    engine: Arc<ScoringEngine>,
    sink: Arc<dyn AlertSink>,
    metrics: Arc<PipelineMetrics>,
    options: RetrainOptions,
    rx: mpsc::Receiver<RetrainReason>,
    /// Keeps the trigger channel open even if every external handle is
    /// dropped, so `recv` never busy-loops on a closed channel.
    _keepalive: mpsc::Sender<RetrainReason>,
    pending: Option<RetrainReason>,
    state: RetrainState,
    last_drift_report: Option<DriftReport>,
}

impl RetrainingLoop {
    pub fn new(
        features: Arc<dyn FeatureStore>,
        models: Arc<dyn ModelStore>,
        engine: Arc<ScoringEngine>,
        sink: Arc<dyn AlertSink>,
        metrics: Arc<PipelineMetrics>,
        options: RetrainOptions,
    ) -> (Self, RetrainHandle) {
        let (tx, rx) = mpsc::channel(1);
        let handle = RetrainHandle { tx: tx.clone() };
        let loop_ = Self {
            features,
            models,
            engine,
            sink,
            metrics,
            options,
            rx,
            _keepalive: tx,
            pending: None,
            state: RetrainState::Idle,
            last_drift_report: None,
        };
        (loop_, handle)
    }

    pub fn state(&self) -> RetrainState {
        self.state
    }

    pub fn last_drift_report(&self) -> Option<&DriftReport> {
        self.last_drift_report.as_ref()
    }

    /// Run forever: scheduled cycles, periodic drift checks that can force
    /// off-schedule cycles, and external triggers.
    pub async fn run(mut self) {
        let mut retrain_tick = tokio::time::interval(self.options.interval);
        let mut drift_tick = tokio::time::interval(self.options.drift_check_interval);
        // Skip the immediate first tick of both timers.
        retrain_tick.tick().await;
        drift_tick.tick().await;

        info!(
            interval_secs = self.options.interval.as_secs(),
            drift_check_secs = self.options.drift_check_interval.as_secs(),
            "Retraining loop started"
        );

        enum Wake {
            Schedule,
            DriftTick,
            Trigger(Option<RetrainReason>),
        }

        loop {
            let wake = tokio::select! {
                _ = retrain_tick.tick() => Wake::Schedule,
                _ = drift_tick.tick() => Wake::DriftTick,
                reason = self.rx.recv() => Wake::Trigger(reason),
            };

            match wake {
                Wake::Schedule => self.run_cycle(RetrainReason::Schedule).await,
                Wake::DriftTick => {
                    if let Some(report) = self.check_drift(Utc::now()) {
                        if report.exceeded {
                            warn!(
                                psi = report.current_value,
                                threshold = self.options.drift_threshold,
                                "Drift threshold exceeded, forcing off-schedule retraining"
                            );
                            self.run_cycle(RetrainReason::Drift).await;
                        }
                    }
                }
                Wake::Trigger(Some(reason)) => self.run_cycle(reason).await,
                // Every trigger handle dropped; scheduled cycles continue.
                Wake::Trigger(None) => {}
            }

            // A trigger that superseded an in-flight cycle runs now.
            while let Some(reason) = self.pending.take() {
                self.run_cycle(reason).await;
            }
        }
    }

    /// Execute one full cycle. Public for tests and for embedding.
    pub async fn run_cycle(&mut self, reason: RetrainReason) {
        info!(reason = %reason, "Retraining cycle started");
        let now = Utc::now();

        self.set_state(RetrainState::DriftCheck);
        self.check_drift(now);
        if self.superseded() {
            info!("Retraining cycle superseded during drift check, abandoning");
            self.set_state(RetrainState::Idle);
            return;
        }

        self.set_state(RetrainState::Training);
        let window = (now - self.options.training_window, now);
        let features = match self.features.read_window(window.0, window.1) {
            Ok(features) => features,
            Err(e) => {
                warn!(error = %e, "Failed to read training window");
                self.set_state(RetrainState::Idle);
                return;
            }
        };

        if features.len() < self.options.min_samples {
            info!(
                samples = features.len(),
                min_samples = self.options.min_samples,
                "Insufficient training data, skipping retraining"
            );
            self.set_state(RetrainState::Idle);
            return;
        }

        self.metrics.retrain_total.fetch_add(1, Ordering::Relaxed);

        let version = self.next_version();
        let candidate = match train_snapshot(&features, &self.options.training, version, window) {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(error = %e, "Candidate training failed");
                self.roll_back(format!("candidate training failed: {e}")).await;
                return;
            }
        };
        if self.superseded() {
            info!("Retraining cycle superseded during training, abandoning");
            self.set_state(RetrainState::Idle);
            return;
        }

        self.set_state(RetrainState::Validating);
        let verdict = self.validate(candidate.validation.quality, &features);
        if !verdict.passed {
            warn!(
                candidate_quality = verdict.candidate_quality,
                active_quality = ?verdict.active_quality,
                reason = %verdict.reason,
                "Candidate rejected, keeping active model"
            );
            self.roll_back(format!("model validation failed: {}", verdict.reason))
                .await;
            return;
        }

        self.set_state(RetrainState::Promoting);
        if let Err(e) = self.models.store(&candidate) {
            warn!(error = %e, "Failed to persist candidate snapshot");
            self.roll_back(format!("snapshot store failed: {e}")).await;
            return;
        }

        self.engine.install(ActiveModel::from_snapshot(candidate));
        self.metrics.set_active_model_version(version);

        match self.models.prune(self.options.retain_generations) {
            Ok(removed) if removed > 0 => {
                debug!(removed, "Pruned old model generations");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Snapshot prune failed"),
        }

        info!(version, "Candidate promoted to active model");
        self.set_state(RetrainState::Idle);
    }

    /// Compare the recent feature window against the active model's
    /// training baseline. Returns `None` while degraded or with too little
    /// recent data.
    pub fn check_drift(&mut self, now: DateTime<Utc>) -> Option<DriftReport> {
        let active = self.engine.active()?;
        let window = (now - self.options.drift_window, now);

        let current = match self.features.read_window(window.0, window.1) {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, "Failed to read drift window");
                return None;
            }
        };
        if current.len() < DRIFT_MIN_SAMPLES {
            return None;
        }

        let report =
            active
                .snapshot
                .baseline
                .check(&current, window, self.options.drift_threshold);
        self.metrics.set_last_drift_score(report.current_value);
        debug!(
            psi = report.current_value,
            exceeded = report.exceeded,
            samples = current.len(),
            "Drift check complete"
        );

        self.last_drift_report = Some(report.clone());
        Some(report)
    }

    /// Promotion gate: absolute quality floor plus improvement over the
    /// active model, both measured on the candidate's held-out split.
    fn validate(
        &self,
        candidate_quality: f64,
        features: &[crate::types::FeatureVector],
    ) -> ValidationVerdict {
        if candidate_quality < self.options.min_quality {
            return ValidationVerdict {
                passed: false,
                candidate_quality,
                active_quality: None,
                reason: format!(
                    "quality {candidate_quality:.3} below floor {:.3}",
                    self.options.min_quality
                ),
            };
        }

        let Some(active) = self.engine.active() else {
            return ValidationVerdict {
                passed: true,
                candidate_quality,
                active_quality: None,
                reason: "no active model".to_string(),
            };
        };

        let holdout = holdout_matrix(features, &self.options.training);
        let active_quality = evaluate_quality(
            active.scorer.as_ref(),
            active.snapshot.decision_threshold,
            &holdout,
            self.options.training.target_anomaly_rate,
        )
        .unwrap_or(0.0);

        let required = active_quality + self.options.improvement_margin;
        if candidate_quality >= required {
            ValidationVerdict {
                passed: true,
                candidate_quality,
                active_quality: Some(active_quality),
                reason: "ok".to_string(),
            }
        } else {
            ValidationVerdict {
                passed: false,
                candidate_quality,
                active_quality: Some(active_quality),
                reason: format!(
                    "quality {candidate_quality:.3} below required {required:.3}"
                ),
            }
        }
    }

    async fn roll_back(&mut self, message: String) {
        self.set_state(RetrainState::RolledBack);
        self.metrics
            .retrain_failures_total
            .fetch_add(1, Ordering::Relaxed);

        let alert = AlertEvent::Operational(OperationalAlert::new(message));
        if let Err(e) = self.sink.notify(&alert).await {
            warn!(error = %e, "Failed to deliver rollback alert");
        }
        self.set_state(RetrainState::Idle);
    }

    fn next_version(&self) -> u64 {
        let stored = self.models.latest_version().ok().flatten().unwrap_or(0);
        let active = self.engine.active_version().unwrap_or(0);
        stored.max(active) + 1
    }

    fn superseded(&mut self) -> bool {
        match self.rx.try_recv() {
            Ok(reason) => {
                self.pending = Some(reason);
                true
            }
            Err(_) => false,
        }
    }

    fn set_state(&mut self, state: RetrainState) {
        debug!(state = ?state, "Retraining state");
        self.state = state;
    }
}
