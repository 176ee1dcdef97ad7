//! Subsystem health tracking for the health endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::cache::CacheStats;
use crate::ensemble::AccuracyReport;

/// Consecutive failures after which a model no longer counts as usable.
const MODEL_FAILURE_LIMIT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelHealth {
    pub loaded: bool,
    pub restored_from_disk: bool,
    pub last_saved: Option<DateTime<Utc>>,
    pub last_trained: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl ModelHealth {
    fn usable(&self) -> bool {
        self.loaded && self.consecutive_failures < MODEL_FAILURE_LIMIT
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub available: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub generated_at: DateTime<Utc>,
    pub models: BTreeMap<String, ModelHealth>,
    pub sources: BTreeMap<String, SourceHealth>,
    pub cache: CacheStats,
    pub processed_matches: u64,
    pub accuracy: AccuracyReport,
}

#[derive(Clone, Default)]
pub struct HealthMonitor {
    inner: Arc<RwLock<HealthInner>>,
}

#[derive(Default)]
struct HealthInner {
    models: BTreeMap<String, ModelHealth>,
    sources: BTreeMap<String, SourceHealth>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_model(&self, name: &str) {
        let mut inner = self.inner.write().await;
        inner.models.entry(name.to_string()).or_default().loaded = true;
    }

    pub async fn model_restored(&self, name: &str, saved_at: DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        let m = inner.models.entry(name.to_string()).or_default();
        m.restored_from_disk = true;
        m.last_saved = Some(saved_at);
    }

    pub async fn model_trained(&self, name: &str, saved_at: Option<DateTime<Utc>>) {
        let mut inner = self.inner.write().await;
        let m = inner.models.entry(name.to_string()).or_default();
        m.last_trained = Some(Utc::now());
        if saved_at.is_some() {
            m.last_saved = saved_at;
        }
        m.consecutive_failures = 0;
    }

    pub async fn model_succeeded(&self, name: &str) {
        let mut inner = self.inner.write().await;
        if let Some(m) = inner.models.get_mut(name) {
            m.consecutive_failures = 0;
        }
    }

    pub async fn model_failed(&self, name: &str, error: &str) {
        let mut inner = self.inner.write().await;
        let m = inner.models.entry(name.to_string()).or_default();
        m.last_error = Some(error.to_string());
        m.consecutive_failures += 1;
    }

    pub async fn source_result(&self, name: &str, error: Option<&str>) {
        let mut inner = self.inner.write().await;
        let s = inner.sources.entry(name.to_string()).or_default();
        match error {
            None => {
                s.available = true;
                s.last_success = Some(Utc::now());
                s.consecutive_failures = 0;
            }
            Some(e) => {
                s.available = false;
                s.last_failure = Some(Utc::now());
                s.last_error = Some(e.to_string());
                s.consecutive_failures += 1;
            }
        }
    }

    pub async fn snapshot(
        &self,
        cache: CacheStats,
        processed_matches: u64,
        accuracy: AccuracyReport,
    ) -> HealthSnapshot {
        let inner = self.inner.read().await;
        HealthSnapshot {
            status: overall_status(&inner.models, &inner.sources),
            generated_at: Utc::now(),
            models: inner.models.clone(),
            sources: inner.sources.clone(),
            cache,
            processed_matches,
            accuracy,
        }
    }
}

/// Unhealthy when no model can predict; degraded when any model or source
/// is failing.
fn overall_status(
    models: &BTreeMap<String, ModelHealth>,
    sources: &BTreeMap<String, SourceHealth>,
) -> HealthStatus {
    if !models.values().any(ModelHealth::usable) {
        return HealthStatus::Unhealthy;
    }
    let model_trouble = models.values().any(|m| !m.usable() || m.consecutive_failures > 0);
    let source_trouble = sources.values().any(|s| !s.available);
    if model_trouble || source_trouble {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_models_is_unhealthy() {
        let h = HealthMonitor::new();
        let snap = h.snapshot(CacheStats::default(), 0, AccuracyReport::default()).await;
        assert_eq!(snap.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_all_good_is_healthy() {
        let h = HealthMonitor::new();
        h.register_model("elo").await;
        h.source_result("nhl-standings", None).await;
        let snap = h.snapshot(CacheStats::default(), 3, AccuracyReport::default()).await;
        assert_eq!(snap.status, HealthStatus::Healthy);
        assert_eq!(snap.processed_matches, 3);
    }

    #[tokio::test]
    async fn test_failing_source_degrades() {
        let h = HealthMonitor::new();
        h.register_model("elo").await;
        h.source_result("nhl-standings", Some("timed out")).await;
        let snap = h.snapshot(CacheStats::default(), 0, AccuracyReport::default()).await;
        assert_eq!(snap.status, HealthStatus::Degraded);
        assert_eq!(snap.sources["nhl-standings"].last_error.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn test_repeated_model_failures_make_it_unusable() {
        let h = HealthMonitor::new();
        h.register_model("elo").await;
        for _ in 0..MODEL_FAILURE_LIMIT {
            h.model_failed("elo", "non-finite output").await;
        }
        let snap = h.snapshot(CacheStats::default(), 0, AccuracyReport::default()).await;
        assert_eq!(snap.status, HealthStatus::Unhealthy);

        h.model_succeeded("elo").await;
        let snap = h.snapshot(CacheStats::default(), 0, AccuracyReport::default()).await;
        assert_eq!(snap.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_training_records_timestamps() {
        let h = HealthMonitor::new();
        h.register_model("poisson").await;
        let saved = Utc::now();
        h.model_trained("poisson", Some(saved)).await;
        let snap = h.snapshot(CacheStats::default(), 1, AccuracyReport::default()).await;
        let m = &snap.models["poisson"];
        assert_eq!(m.last_saved, Some(saved));
        assert!(m.last_trained.is_some());
    }
}
