//! Last-known-good predictions, keyed by match id.
//!
//! An entry stays valid until the match's scheduled start has passed, or,
//! when no start time is known, until the TTL elapses.  A store never
//! replaces an entry with an older prediction.

pub mod degraded;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::ensemble::Prediction;

/// Which stage of the fallback chain produced a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionSource {
    Live,
    Cached,
    Degraded,
}

impl PredictionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            PredictionSource::Live => "live",
            PredictionSource::Cached => "cached",
            PredictionSource::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub fresh: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Clone)]
pub struct PredictionCache {
    inner: Arc<RwLock<CacheInner>>,
    ttl: ChronoDuration,
}

struct CacheInner {
    entries: HashMap<String, Prediction>,
    hits: u64,
    misses: u64,
}

impl PredictionCache {
    pub fn new(ttl: std::time::Duration) -> Self {
        PredictionCache {
            inner: Arc::new(RwLock::new(CacheInner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
            })),
            ttl: ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(6)),
        }
    }

    fn is_fresh(&self, p: &Prediction, now: DateTime<Utc>) -> bool {
        match p.scheduled_at {
            Some(start) => now < start,
            // An expiry past the representable range never arrives.
            None => p
                .generated_at
                .checked_add_signed(self.ttl)
                .map_or(true, |expires_at| now < expires_at),
        }
    }

    /// Store a prediction unless a newer one is already cached.  Returns
    /// whether the entry was written.
    pub async fn store(&self, prediction: Prediction) -> bool {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.entries.get(&prediction.match_id) {
            if existing.generated_at > prediction.generated_at {
                debug!(
                    "Cache: keeping newer prediction for {} ({} > {})",
                    prediction.match_id, existing.generated_at, prediction.generated_at
                );
                return false;
            }
        }
        inner.entries.insert(prediction.match_id.clone(), prediction);
        true
    }

    /// Unexpired entry for `match_id`, if any.
    pub async fn get(&self, match_id: &str) -> Option<Prediction> {
        self.get_at(match_id, Utc::now()).await
    }

    pub async fn get_at(&self, match_id: &str, now: DateTime<Utc>) -> Option<Prediction> {
        let mut inner = self.inner.write().await;
        let hit = inner
            .entries
            .get(match_id)
            .filter(|p| self.is_fresh(p, now))
            .cloned();
        if hit.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        hit
    }

    /// Entry regardless of expiry; used to recover the feature vector a
    /// finished match was predicted with.
    pub async fn peek(&self, match_id: &str) -> Option<Prediction> {
        self.inner.read().await.entries.get(match_id).cloned()
    }

    /// Drop expired entries, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now()).await
    }

    pub async fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.entries.len();
        inner.entries.retain(|_, p| self.is_fresh(p, now));
        before - inner.entries.len()
    }

    pub async fn stats(&self) -> CacheStats {
        let now = Utc::now();
        let inner = self.inner.read().await;
        CacheStats {
            entries: inner.entries.len(),
            fresh: inner.entries.values().filter(|p| self.is_fresh(p, now)).count(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FallbackPolicy;
    use std::time::Duration;

    fn prediction(match_id: &str, generated_at: DateTime<Utc>) -> Prediction {
        let mut p = degraded::degraded_prediction(
            &crate::ensemble::MatchRequest {
                match_id: match_id.into(),
                home_team: "BOS".into(),
                away_team: "TOR".into(),
                date: generated_at.date_naive(),
                scheduled_at: None,
            },
            &FallbackPolicy::default(),
            0.22,
        );
        p.generated_at = generated_at;
        p.degraded = false;
        p
    }

    #[tokio::test]
    async fn test_hit_within_ttl_miss_after() {
        let cache = PredictionCache::new(Duration::from_secs(3600));
        let now = Utc::now();
        cache.store(prediction("m1", now)).await;
        assert!(cache.get_at("m1", now + ChronoDuration::minutes(30)).await.is_some());
        assert!(cache.get_at("m1", now + ChronoDuration::minutes(61)).await.is_none());
        let stats = cache.stats().await;
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn test_huge_ttl_does_not_overflow() {
        let cache = PredictionCache::new(Duration::from_secs(1_000_000_000_000_000));
        let now = Utc::now();
        cache.store(prediction("m1", now)).await;
        assert!(cache.get_at("m1", now + ChronoDuration::days(3650)).await.is_some());
        assert_eq!(cache.purge_expired_at(now).await, 0);
    }

    #[tokio::test]
    async fn test_scheduled_start_bounds_validity() {
        let cache = PredictionCache::new(Duration::from_secs(6 * 3600));
        let now = Utc::now();
        let mut p = prediction("m1", now);
        p.scheduled_at = Some(now + ChronoDuration::minutes(10));
        cache.store(p).await;
        assert!(cache.get_at("m1", now + ChronoDuration::minutes(5)).await.is_some());
        assert!(cache.get_at("m1", now + ChronoDuration::minutes(11)).await.is_none());
        assert!(cache.peek("m1").await.is_some());
    }

    #[tokio::test]
    async fn test_older_prediction_does_not_overwrite_newer() {
        let cache = PredictionCache::new(Duration::from_secs(3600));
        let now = Utc::now();
        let mut newer = prediction("m1", now);
        newer.confidence = 0.9;
        assert!(cache.store(newer).await);
        assert!(!cache.store(prediction("m1", now - ChronoDuration::minutes(5))).await);
        assert_eq!(cache.peek("m1").await.unwrap().confidence, 0.9);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let cache = PredictionCache::new(Duration::from_secs(3600));
        let now = Utc::now();
        cache.store(prediction("old", now - ChronoDuration::hours(2))).await;
        cache.store(prediction("new", now)).await;
        assert_eq!(cache.purge_expired_at(now).await, 1);
        assert_eq!(cache.stats().await.entries, 1);
    }
}
