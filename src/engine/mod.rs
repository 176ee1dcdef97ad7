//! The prediction engine: model registry, live → cache → degraded fallback
//! chain, and transactional online training.
//!
//! Each model sits in its own `RwLock`.  Predictions take read locks only;
//! training takes one model's write lock at a time, updates a scratch copy,
//! persists it, then swaps it in, so a failed save leaves both memory and
//! disk at the previous state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::degraded::degraded_prediction;
use crate::cache::{PredictionCache, PredictionSource};
use crate::db::models::PredictionLogEntry;
use crate::db::Database;
use crate::ensemble::calibration::CalibrationState;
use crate::ensemble::weights::WeightState;
use crate::ensemble::{
    blend, favoured_side, AdaptiveWeights, BlendPolicy, CalibrationPolicy, ConfidenceCalibrator,
    EnsembleWeights, MatchRequest, ModelOutput, Prediction, WeightPolicy,
};
use crate::error::{EngineError, Result};
use crate::features::{Extraction, FallbackPolicy, FeatureExtractor, FeatureVector};
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::models::{
    team_code, MatchFeatures, MatchResult, ModelSettings, ModelState, ModelSummary, OutcomeDistribution,
    PredictionModel,
};
use crate::persistence::{LoadOutcome, SnapshotStore};

const WEIGHTS_SNAPSHOT: &str = "ensemble_weights";
const CALIBRATION_SNAPSHOT: &str = "confidence_calibration";

/// Every tunable of the engine in one place.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub fallback: FallbackPolicy,
    pub models: ModelSettings,
    pub blend: BlendPolicy,
    pub base_weights: EnsembleWeights,
    pub weight_policy: WeightPolicy,
    pub adaptive_weights: bool,
    pub calibration: CalibrationPolicy,
    /// Overall budget for the live prediction path.
    pub predict_deadline: Duration,
    /// Cache lifetime for predictions without a scheduled start.
    pub cache_ttl: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            fallback: FallbackPolicy::default(),
            models: ModelSettings::default(),
            blend: BlendPolicy::default(),
            base_weights: EnsembleWeights::default(),
            weight_policy: WeightPolicy::default(),
            adaptive_weights: true,
            calibration: CalibrationPolicy::default(),
            predict_deadline: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(6 * 60 * 60),
        }
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

pub struct ModelSlot {
    name: String,
    model: RwLock<Box<dyn PredictionModel>>,
}

/// The fixed set of models the engine runs, built once at startup.
pub struct ModelRegistry {
    slots: Vec<ModelSlot>,
}

impl ModelRegistry {
    pub fn new(models: Vec<Box<dyn PredictionModel>>) -> Result<Self> {
        let mut slots: Vec<ModelSlot> = Vec::with_capacity(models.len());
        for model in models {
            let name = model.name().to_string();
            if slots.iter().any(|s| s.name == name) {
                return Err(EngineError::DuplicateModel(name));
            }
            slots.push(ModelSlot {
                name,
                model: RwLock::new(model),
            });
        }
        Ok(ModelRegistry { slots })
    }

    pub fn get(&self, name: &str) -> Option<&ModelSlot> {
        self.slots.iter().find(|s| s.name == name)
    }

    pub fn slots(&self) -> &[ModelSlot] {
        &self.slots
    }

    pub fn names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.name.as_str()).collect()
    }
}

// ── Outcomes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrainOutcome {
    Applied {
        updated: Vec<String>,
        failed: Vec<String>,
    },
    AlreadyProcessed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelReport {
    #[serde(flatten)]
    pub summary: ModelSummary,
    pub weight: Option<f64>,
    pub scored_matches: u64,
    pub mean_brier: Option<f64>,
}

struct TrainedSlot {
    /// The model's forecast before it learned from the result.
    prior: Option<OutcomeDistribution>,
    saved_at: Option<DateTime<Utc>>,
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct Engine {
    registry: ModelRegistry,
    extractor: FeatureExtractor,
    store: SnapshotStore,
    ledger: Database,
    cache: PredictionCache,
    health: HealthMonitor,
    weights: RwLock<AdaptiveWeights>,
    calibration: RwLock<ConfidenceCalibrator>,
    settings: EngineSettings,
}

impl Engine {
    pub async fn new(
        settings: EngineSettings,
        registry: ModelRegistry,
        extractor: FeatureExtractor,
        store: SnapshotStore,
        ledger: Database,
    ) -> Self {
        let health = HealthMonitor::new();
        for name in registry.names() {
            health.register_model(name).await;
        }
        let weights = AdaptiveWeights::new(
            settings.base_weights.clone(),
            settings.weight_policy.clone(),
            settings.adaptive_weights,
        );
        Engine {
            cache: PredictionCache::new(settings.cache_ttl),
            calibration: RwLock::new(ConfidenceCalibrator::new(settings.calibration.clone())),
            registry,
            extractor,
            store,
            ledger,
            health,
            weights: RwLock::new(weights),
            settings,
        }
    }

    /// Load every persisted model, the ensemble weights and the confidence
    /// calibration.  Unusable snapshots leave that part at its initial state.
    pub async fn restore_all(&self) {
        for slot in self.registry.slots() {
            let LoadOutcome::Restored { state, saved_at } = self.store.load::<ModelState>(&slot.name) else {
                continue;
            };
            let mut model = slot.model.write().await;
            match model.restore(state) {
                Ok(()) => self.health.model_restored(&slot.name, saved_at).await,
                Err(e) => warn!("{}, starting fresh", e),
            }
        }

        if let LoadOutcome::Restored { state, .. } = self.store.load::<WeightState>(WEIGHTS_SNAPSHOT) {
            self.weights.write().await.restore(state);
        }
        if let LoadOutcome::Restored { state, .. } = self.store.load::<CalibrationState>(CALIBRATION_SNAPSHOT) {
            self.calibration.write().await.restore(state);
        }
    }

    // ── Prediction ────────────────────────────────────────────────────────────

    /// Always returns a prediction: live if possible, else the cached one,
    /// else a degraded neutral prediction.
    pub async fn predict(&self, request: &MatchRequest) -> Prediction {
        self.predict_with_source(request).await.0
    }

    pub async fn predict_with_source(&self, request: &MatchRequest) -> (Prediction, PredictionSource) {
        let request = &MatchRequest {
            home_team: team_code(&request.home_team),
            away_team: team_code(&request.away_team),
            ..request.clone()
        };
        let deadline = self.settings.predict_deadline;
        let (prediction, source) = match tokio::time::timeout(deadline, self.predict_live(request)).await {
            Ok(Ok(p)) => {
                self.cache.store(p.clone()).await;
                (p, PredictionSource::Live)
            }
            Ok(Err(e)) => {
                warn!("Live prediction for {} failed: {}", request.match_id, e);
                self.fallback(request).await
            }
            Err(_) => {
                warn!(
                    "Live prediction for {} exceeded {:?}, falling back",
                    request.match_id, deadline
                );
                self.fallback(request).await
            }
        };

        info!(
            "Prediction {} ({}): {} {:.3}/{:.3}/{:.3} conf={:.3} quality={:.2}",
            prediction.match_id,
            source.as_str(),
            prediction.predicted_winner,
            prediction.p_home_win,
            prediction.p_away_win,
            prediction.p_other,
            prediction.confidence,
            prediction.data_quality
        );
        if let Err(e) = self.ledger.log_prediction(&prediction, source) {
            warn!("Failed to log prediction {}: {}", prediction.match_id, e);
        }
        (prediction, source)
    }

    async fn fallback(&self, request: &MatchRequest) -> (Prediction, PredictionSource) {
        match self.cache.get(&request.match_id).await {
            Some(p) => (p, PredictionSource::Cached),
            None => (
                degraded_prediction(request, &self.settings.fallback, self.settings.models.tie_share),
                PredictionSource::Degraded,
            ),
        }
    }

    async fn predict_live(&self, request: &MatchRequest) -> Result<Prediction> {
        let extraction = self
            .extractor
            .extract(&request.home_team, &request.away_team, request.date)
            .await;
        self.record_sources(&extraction).await;

        let features = MatchFeatures {
            home_team: request.home_team.clone(),
            away_team: request.away_team.clone(),
            features: extraction.vector,
        };
        let outputs = self.run_models(&features).await;
        let weights = self.weights.read().await.current().clone();

        let mut blended = blend(&outputs, &weights, extraction.data_quality, &self.settings.blend)
            .ok_or_else(|| EngineError::degenerate("ensemble", "no model produced a usable prediction"))?;
        blended.confidence = self.calibration.read().await.calibrate(blended.confidence);
        Ok(Prediction::from_blend(
            request,
            blended,
            extraction.data_quality,
            features.features,
        ))
    }

    /// Predict with every model concurrently; failing models are dropped
    /// from this blend and reported.
    async fn run_models(&self, features: &MatchFeatures) -> Vec<ModelOutput> {
        let runs = self.registry.slots().iter().map(|slot| async move {
            let model = slot.model.read().await;
            let out = model.predict(features).and_then(|d| d.check(&slot.name).map(|_| d));
            (slot.name.as_str(), out)
        });
        let results = futures_util::future::join_all(runs).await;

        let mut outputs = Vec::with_capacity(results.len());
        for (name, out) in results {
            match out {
                Ok(distribution) => {
                    self.health.model_succeeded(name).await;
                    outputs.push(ModelOutput {
                        name: name.to_string(),
                        distribution,
                    });
                }
                Err(e) => {
                    warn!("Excluding model from blend: {}", e);
                    self.health.model_failed(name, &e.to_string()).await;
                }
            }
        }
        outputs
    }

    async fn record_sources(&self, extraction: &Extraction) {
        let mut by_provider: BTreeMap<&str, Option<&str>> = BTreeMap::new();
        for slice in extraction.slices.iter().filter(|s| s.provider != "none") {
            let entry = by_provider.entry(slice.provider.as_str()).or_insert(None);
            if slice.failed && entry.is_none() {
                *entry = Some(slice.reason.as_deref().unwrap_or("failed"));
            }
        }
        for (provider, error) in by_provider {
            self.health.source_result(provider, error).await;
        }
    }

    // ── Training ──────────────────────────────────────────────────────────────

    /// Apply a completed match to every model.  A match id is applied at most
    /// once; repeats return `AlreadyProcessed` without touching any state.
    pub async fn train(&self, result: &MatchResult) -> Result<TrainOutcome> {
        let result = &result.normalized();
        result.validate()?;
        if self.ledger.is_processed(&result.match_id)? {
            debug!("Match {} already processed", result.match_id);
            return Ok(TrainOutcome::AlreadyProcessed);
        }

        // Features are resolved before any model lock is taken.
        let (vector, data_quality) = self.training_features(result).await;
        let features = MatchFeatures {
            home_team: result.home_team.clone(),
            away_team: result.away_team.clone(),
            features: vector,
        };

        if !self.ledger.claim_match(result)? {
            return Ok(TrainOutcome::AlreadyProcessed);
        }

        let features = &features;
        let runs = self
            .registry
            .slots()
            .iter()
            .map(|slot| async move { (slot, self.train_slot(slot, result, features).await) });
        let results = futures_util::future::join_all(runs).await;

        let mut updated = Vec::new();
        let mut failed = Vec::new();
        let mut priors = Vec::new();
        for (slot, outcome) in results {
            match outcome {
                Ok(trained) => {
                    self.health.model_trained(&slot.name, trained.saved_at).await;
                    if let Some(distribution) = trained.prior {
                        priors.push(ModelOutput {
                            name: slot.name.clone(),
                            distribution,
                        });
                    }
                    updated.push(slot.name.clone());
                }
                Err(e) => {
                    warn!("Training {} on {} failed, keeping previous state: {}", slot.name, result.match_id, e);
                    self.health.model_failed(&slot.name, &e.to_string()).await;
                    failed.push(slot.name.clone());
                }
            }
        }

        self.score_forecasts(result, &priors, data_quality).await;

        info!(
            "Trained on {} ({} {}-{} {}): {} updated, {} failed",
            result.match_id,
            result.home_team,
            result.home_score,
            result.away_score,
            result.away_team,
            updated.len(),
            failed.len()
        );
        Ok(TrainOutcome::Applied { updated, failed })
    }

    /// Feed the pre-update forecasts to the adaptive weights and the
    /// confidence calibration.  Each snapshot is written while its lock is
    /// held, so a concurrent train can never persist an older state last.
    async fn score_forecasts(&self, result: &MatchResult, priors: &[ModelOutput], data_quality: f64) {
        let actual = result.winner();
        let tie_epsilon = self.settings.blend.tie_epsilon;

        let ensemble_prior = {
            let mut weights = self.weights.write().await;
            let ensemble_prior = blend(priors, weights.current(), data_quality, &self.settings.blend);
            for o in priors {
                weights.record(&o.name, o.distribution.brier(result.outcome()));
            }
            if let Err(e) = self.store.save(WEIGHTS_SNAPSHOT, &weights.snapshot()) {
                warn!("Failed to persist ensemble weights: {}", e);
            }
            ensemble_prior
        };

        let mut calibration = self.calibration.write().await;
        for o in priors {
            let picked = favoured_side(o.distribution.p_home_win, o.distribution.p_away_win, tie_epsilon);
            calibration.record_model(&o.name, picked, actual);
        }
        if let Some(b) = &ensemble_prior {
            calibration.record_ensemble(b.confidence, b.winner, actual);
        }
        if let Err(e) = self.store.save(CALIBRATION_SNAPSHOT, &calibration.snapshot()) {
            warn!("Failed to persist confidence calibration: {}", e);
        }
    }

    /// The vector the match was predicted with, if still cached; otherwise a
    /// fresh extraction as of match day.  Also returns its data quality.
    async fn training_features(&self, result: &MatchResult) -> (FeatureVector, f64) {
        if let Some(p) = self.cache.peek(&result.match_id).await {
            if p.home_team == result.home_team && p.away_team == result.away_team && !p.degraded {
                match p.features.sanitized(&self.settings.fallback) {
                    Ok(v) => return (v, p.data_quality),
                    Err(e) => debug!("Cached features for {} unusable: {}", result.match_id, e),
                }
            }
        }
        let extraction = self
            .extractor
            .extract(&result.home_team, &result.away_team, result.played_on)
            .await;
        (extraction.vector, extraction.data_quality)
    }

    async fn train_slot(
        &self,
        slot: &ModelSlot,
        result: &MatchResult,
        features: &MatchFeatures,
    ) -> Result<TrainedSlot> {
        let mut model = slot.model.write().await;

        // Kept for scoring once every model has trained.
        let prior = model.predict(features).ok().filter(|d| d.check(&slot.name).is_ok());

        let mut scratch = model.clone_box();
        scratch.update(result, features)?;
        let state = scratch.snapshot();
        let saved_at = match state {
            ModelState::Stateless => None,
            ref state => Some(self.store.save(&slot.name, state)?),
        };
        *model = scratch;
        Ok(TrainedSlot { prior, saved_at })
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    pub async fn model_snapshot(&self, name: &str) -> Result<ModelReport> {
        let slot = self
            .registry
            .get(name)
            .ok_or_else(|| EngineError::UnknownModel(name.to_string()))?;
        let summary = slot.model.read().await.summary();
        let weights = self.weights.read().await;
        let track = weights.tracks().get(name);
        Ok(ModelReport {
            summary,
            weight: weights.current().get(name),
            scored_matches: track.map(|t| t.samples).unwrap_or(0),
            mean_brier: track.and_then(|t| t.mean_brier()),
        })
    }

    pub async fn health_snapshot(&self) -> HealthSnapshot {
        let processed = self.ledger.processed_count().unwrap_or_else(|e| {
            warn!("Failed to count processed matches: {}", e);
            0
        });
        let accuracy = self.calibration.read().await.report();
        self.health.snapshot(self.cache.stats().await, processed, accuracy).await
    }

    pub fn model_names(&self) -> Vec<&str> {
        self.registry.names()
    }

    pub fn recent_predictions(&self, limit: i64) -> Result<Vec<PredictionLogEntry>> {
        self.ledger.recent_predictions(limit)
    }

    pub async fn purge_cache(&self) -> usize {
        self.cache.purge_expired().await
    }
}
