//! Feature extraction: raw team data and auxiliary signals → a fixed-length,
//! versioned vector of finite floats.
//!
//! Every feature group is queried once per side, all queries run
//! concurrently, and each carries its own timeout.  A slice that fails, times
//! out or answers with nothing usable falls back to the `FallbackPolicy`
//! defaults and is reported as a degradation; extraction itself never fails.
//!
//! Layout v1 interleaves the two sides per field: `index = 2 * field + side`.

pub mod history;
pub mod sources;
pub mod standings;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::EngineError;
pub use sources::{SignalQuery, SignalSource};

pub const FEATURE_VERSION: u32 = 1;
pub const FIELD_COUNT: usize = 16;
pub const FEATURE_COUNT: usize = FIELD_COUNT * 2;

/// Division that never produces NaN or infinity.
///
/// Returns `default` when the denominator is zero or non-finite, or when the
/// quotient itself is non-finite.
pub fn safe_div(numerator: f64, denominator: f64, default: f64) -> f64 {
    if denominator == 0.0 || !denominator.is_finite() {
        return default;
    }
    let q = numerator / denominator;
    if q.is_finite() {
        q
    } else {
        default
    }
}

// ── Layout ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Home,
    Away,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Home, Side::Away];

    pub fn index(self) -> usize {
        match self {
            Side::Home => 0,
            Side::Away => 1,
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Home => Side::Away,
            Side::Away => Side::Home,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Home => "home",
            Side::Away => "away",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureGroup {
    Standings,
    GoalieForm,
    MarketOdds,
    TravelRest,
    RollingForm,
    MatchupHistory,
    PlayerImpact,
}

impl FeatureGroup {
    pub const ALL: [FeatureGroup; 7] = [
        FeatureGroup::Standings,
        FeatureGroup::GoalieForm,
        FeatureGroup::MarketOdds,
        FeatureGroup::TravelRest,
        FeatureGroup::RollingForm,
        FeatureGroup::MatchupHistory,
        FeatureGroup::PlayerImpact,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FeatureGroup::Standings => "standings",
            FeatureGroup::GoalieForm => "goalie_form",
            FeatureGroup::MarketOdds => "market_odds",
            FeatureGroup::TravelRest => "travel_rest",
            FeatureGroup::RollingForm => "rolling_form",
            FeatureGroup::MatchupHistory => "matchup_history",
            FeatureGroup::PlayerImpact => "player_impact",
        }
    }

    pub fn fields(self) -> impl Iterator<Item = Field> {
        Field::ALL.into_iter().filter(move |f| f.group() == self)
    }
}

/// One per-team quantity.  The discriminant order is the pinned vector order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    WinPct,
    GoalsForPerGame,
    GoalsAgainstPerGame,
    PointsPct,
    GoalieSavePct,
    GoalieGsax,
    MarketImpliedProb,
    RestDays,
    BackToBack,
    TravelKm,
    FormWinPct,
    FormGoalDiff,
    MatchupWinPct,
    MatchupGoalDiff,
    LineupStrength,
    InjuryImpact,
}

impl Field {
    pub const ALL: [Field; FIELD_COUNT] = [
        Field::WinPct,
        Field::GoalsForPerGame,
        Field::GoalsAgainstPerGame,
        Field::PointsPct,
        Field::GoalieSavePct,
        Field::GoalieGsax,
        Field::MarketImpliedProb,
        Field::RestDays,
        Field::BackToBack,
        Field::TravelKm,
        Field::FormWinPct,
        Field::FormGoalDiff,
        Field::MatchupWinPct,
        Field::MatchupGoalDiff,
        Field::LineupStrength,
        Field::InjuryImpact,
    ];

    pub fn position(self) -> usize {
        self as usize
    }

    pub fn index(self, side: Side) -> usize {
        2 * self.position() + side.index()
    }

    pub fn group(self) -> FeatureGroup {
        match self {
            Field::WinPct | Field::GoalsForPerGame | Field::GoalsAgainstPerGame | Field::PointsPct => {
                FeatureGroup::Standings
            }
            Field::GoalieSavePct | Field::GoalieGsax => FeatureGroup::GoalieForm,
            Field::MarketImpliedProb => FeatureGroup::MarketOdds,
            Field::RestDays | Field::BackToBack | Field::TravelKm => FeatureGroup::TravelRest,
            Field::FormWinPct | Field::FormGoalDiff => FeatureGroup::RollingForm,
            Field::MatchupWinPct | Field::MatchupGoalDiff => FeatureGroup::MatchupHistory,
            Field::LineupStrength | Field::InjuryImpact => FeatureGroup::PlayerImpact,
        }
    }

    /// Key of this field inside its group's signal payload.
    pub fn key(self) -> &'static str {
        match self {
            Field::WinPct | Field::FormWinPct | Field::MatchupWinPct => "win_pct",
            Field::GoalsForPerGame => "goals_for_per_game",
            Field::GoalsAgainstPerGame => "goals_against_per_game",
            Field::PointsPct => "points_pct",
            Field::GoalieSavePct => "save_pct",
            Field::GoalieGsax => "goals_saved_above_expected",
            Field::MarketImpliedProb => "implied_win_prob",
            Field::RestDays => "rest_days",
            Field::BackToBack => "back_to_back",
            Field::TravelKm => "travel_km",
            Field::FormGoalDiff | Field::MatchupGoalDiff => "goal_diff_per_game",
            Field::LineupStrength => "lineup_strength",
            Field::InjuryImpact => "injury_impact",
        }
    }

    /// Typical magnitude, used to bring inputs to roughly unit range.
    pub fn scale(self) -> f64 {
        match self {
            Field::GoalsForPerGame | Field::GoalsAgainstPerGame => 4.0,
            Field::GoalieGsax => 10.0,
            Field::RestDays => 4.0,
            Field::TravelKm => 3000.0,
            Field::FormGoalDiff | Field::MatchupGoalDiff => 3.0,
            _ => 1.0,
        }
    }
}

// ── Fallback policy ───────────────────────────────────────────────────────────

/// Single owner of every default a feature can fall back to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackPolicy {
    pub league_avg_goals: f64,
    pub default_win_pct: f64,
    pub default_save_pct: f64,
    pub default_rest_days: f64,
    pub default_lineup_strength: f64,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        FallbackPolicy {
            league_avg_goals: 2.8,
            default_win_pct: 0.5,
            default_save_pct: 0.905,
            default_rest_days: 2.0,
            default_lineup_strength: 0.5,
        }
    }
}

impl FallbackPolicy {
    pub fn default_for(&self, field: Field) -> f64 {
        match field {
            Field::WinPct
            | Field::PointsPct
            | Field::MarketImpliedProb
            | Field::FormWinPct
            | Field::MatchupWinPct => self.default_win_pct,
            Field::GoalsForPerGame | Field::GoalsAgainstPerGame => self.league_avg_goals,
            Field::GoalieSavePct => self.default_save_pct,
            Field::RestDays => self.default_rest_days,
            Field::LineupStrength => self.default_lineup_strength,
            Field::GoalieGsax
            | Field::BackToBack
            | Field::TravelKm
            | Field::FormGoalDiff
            | Field::MatchupGoalDiff
            | Field::InjuryImpact => 0.0,
        }
    }
}

// ── Vector ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub version: u32,
    values: Vec<f64>,
}

impl FeatureVector {
    /// Vector made only of policy defaults.
    pub fn defaults(policy: &FallbackPolicy) -> Self {
        Self::build(policy, |_, _| None)
    }

    /// Assemble a vector slot by slot.  A missing or non-finite value is
    /// replaced by the field's default, so the result is always valid.
    pub fn build<F>(policy: &FallbackPolicy, mut value: F) -> Self
    where
        F: FnMut(Field, Side) -> Option<f64>,
    {
        let mut values = vec![0.0; FEATURE_COUNT];
        for field in Field::ALL {
            for side in Side::BOTH {
                values[field.index(side)] = match value(field, side) {
                    Some(v) if v.is_finite() => v,
                    _ => policy.default_for(field),
                };
            }
        }
        FeatureVector {
            version: FEATURE_VERSION,
            values,
        }
    }

    /// Re-validate a vector received from outside the extractor (cache,
    /// API payload).  Wrong layouts are rejected; bad entries are defaulted.
    pub fn sanitized(self, policy: &FallbackPolicy) -> crate::error::Result<Self> {
        if self.version != FEATURE_VERSION || self.values.len() != FEATURE_COUNT {
            return Err(EngineError::InvalidResult(format!(
                "feature vector v{} with {} values, expected v{} with {}",
                self.version,
                self.values.len(),
                FEATURE_VERSION,
                FEATURE_COUNT
            )));
        }
        let values = self.values;
        Ok(Self::build(policy, |field, side| Some(values[field.index(side)])))
    }

    pub fn get(&self, field: Field, side: Side) -> f64 {
        self.values[field.index(side)]
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Values divided by each field's scale.
    pub fn normalized(&self) -> Vec<f64> {
        let mut out = vec![0.0; FEATURE_COUNT];
        for field in Field::ALL {
            for side in Side::BOTH {
                let i = field.index(side);
                out[i] = self.values[i] / field.scale();
            }
        }
        out
    }
}

// ── Extraction ────────────────────────────────────────────────────────────────

/// Outcome of one (group, side) slice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceReport {
    pub group: FeatureGroup,
    pub side: Side,
    pub provider: String,
    pub live: bool,
    /// The source errored or timed out, as opposed to having no data.
    pub failed: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub vector: FeatureVector,
    /// Fraction of slices populated from live sources, in [0, 1].
    pub data_quality: f64,
    pub slices: Vec<SliceReport>,
}

impl Extraction {
    pub fn degradations(&self) -> impl Iterator<Item = &SliceReport> {
        self.slices.iter().filter(|s| !s.live)
    }
}

enum Fetch {
    Live(BTreeMap<String, f64>),
    Unavailable(String),
    Failed(String),
}

pub struct FeatureExtractor {
    sources: BTreeMap<FeatureGroup, Arc<dyn SignalSource>>,
    policy: FallbackPolicy,
    source_timeout: Duration,
}

impl FeatureExtractor {
    pub fn new(policy: FallbackPolicy, source_timeout: Duration) -> Self {
        FeatureExtractor {
            sources: BTreeMap::new(),
            policy,
            source_timeout,
        }
    }

    /// Register the source for its group, replacing any previous one.
    pub fn with_source(mut self, source: Arc<dyn SignalSource>) -> Self {
        self.sources.insert(source.group(), source);
        self
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.values().map(|s| s.name().to_string()).collect()
    }

    pub async fn extract(&self, home: &str, away: &str, as_of: NaiveDate) -> Extraction {
        let timeout = self.source_timeout;

        let fetches: Vec<_> = FeatureGroup::ALL
            .into_iter()
            .flat_map(|group| Side::BOTH.into_iter().map(move |side| (group, side)))
            .map(|(group, side)| {
                let source = self.sources.get(&group).cloned();
                let (team, opponent) = match side {
                    Side::Home => (home, away),
                    Side::Away => (away, home),
                };
                let query = SignalQuery {
                    team: team.to_string(),
                    opponent: opponent.to_string(),
                    side,
                    as_of,
                };
                async move {
                    let Some(source) = source else {
                        return (group, side, "none".to_string(), Fetch::Unavailable("no source configured".to_string()));
                    };
                    let outcome = match tokio::time::timeout(timeout, source.fetch(&query)).await {
                        Ok(Ok(Some(signals))) => Fetch::Live(signals),
                        Ok(Ok(None)) => Fetch::Unavailable("unavailable".to_string()),
                        Ok(Err(e)) => Fetch::Failed(e.to_string()),
                        Err(_) => Fetch::Failed(format!("timed out after {:?}", timeout)),
                    };
                    (group, side, source.name().to_string(), outcome)
                }
            })
            .collect();

        // join_all preserves input order, so assembly below is deterministic.
        let results = futures_util::future::join_all(fetches).await;

        let mut live_values: HashMap<(Field, Side), f64> = HashMap::new();
        let mut slices = Vec::with_capacity(results.len());

        for (group, side, provider, outcome) in results {
            let report = match outcome {
                Fetch::Live(signals) => {
                    let mut any = false;
                    for field in group.fields() {
                        if let Some(v) = signals.get(field.key()).copied().filter(|v| v.is_finite()) {
                            live_values.insert((field, side), v);
                            any = true;
                        } else {
                            debug!(
                                "{} {}: field '{}' missing, using default",
                                group.as_str(),
                                side.as_str(),
                                field.key()
                            );
                        }
                    }
                    if any {
                        SliceReport { group, side, provider, live: true, failed: false, reason: None }
                    } else {
                        SliceReport {
                            group,
                            side,
                            provider,
                            live: false,
                            failed: false,
                            reason: Some("no usable fields".to_string()),
                        }
                    }
                }
                Fetch::Unavailable(reason) => SliceReport {
                    group,
                    side,
                    provider,
                    live: false,
                    failed: false,
                    reason: Some(reason),
                },
                Fetch::Failed(reason) => SliceReport {
                    group,
                    side,
                    provider,
                    live: false,
                    failed: true,
                    reason: Some(reason),
                },
            };

            if !report.live && report.provider != "none" {
                let err = EngineError::DataUnavailable {
                    provider: report.provider.clone(),
                    reason: format!(
                        "{} ({}): {}",
                        group.as_str(),
                        side.as_str(),
                        report.reason.as_deref().unwrap_or("unknown")
                    ),
                };
                warn!("{}, using defaults", err);
            }
            slices.push(report);
        }

        let vector = FeatureVector::build(&self.policy, |field, side| {
            live_values.get(&(field, side)).copied()
        });
        let live = slices.iter().filter(|s| s.live).count();
        let data_quality = safe_div(live as f64, slices.len() as f64, 0.0).clamp(0.0, 1.0);

        Extraction {
            vector,
            data_quality,
            slices,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::Result;
    use approx::assert_relative_eq;
    use async_trait::async_trait;

    /// Source returning fixed values for every team.
    pub(crate) struct FixedSource {
        pub group: FeatureGroup,
        pub values: Vec<(&'static str, f64)>,
    }

    #[async_trait]
    impl SignalSource for FixedSource {
        fn group(&self) -> FeatureGroup {
            self.group
        }
        fn name(&self) -> &str {
            "fixed"
        }
        async fn fetch(&self, _query: &SignalQuery) -> Result<Option<BTreeMap<String, f64>>> {
            Ok(Some(
                self.values.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            ))
        }
    }

    struct FailingSource(FeatureGroup);

    #[async_trait]
    impl SignalSource for FailingSource {
        fn group(&self) -> FeatureGroup {
            self.0
        }
        fn name(&self) -> &str {
            "failing"
        }
        async fn fetch(&self, _query: &SignalQuery) -> Result<Option<BTreeMap<String, f64>>> {
            anyhow::bail!("connection refused")
        }
    }

    struct SlowSource;

    #[async_trait]
    impl SignalSource for SlowSource {
        fn group(&self) -> FeatureGroup {
            FeatureGroup::MarketOdds
        }
        fn name(&self) -> &str {
            "slow"
        }
        async fn fetch(&self, _query: &SignalQuery) -> Result<Option<BTreeMap<String, f64>>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Some(BTreeMap::from([("implied_win_prob".to_string(), 0.7)])))
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
    }

    #[test]
    fn test_safe_div_zero_denominator_returns_default() {
        assert_eq!(safe_div(5.0, 0.0, 0.5), 0.5);
        assert_eq!(safe_div(0.0, 0.0, 2.8), 2.8);
    }

    #[test]
    fn test_safe_div_non_finite_inputs() {
        assert_eq!(safe_div(1.0, f64::NAN, 0.5), 0.5);
        assert_eq!(safe_div(1.0, f64::INFINITY, 0.5), 0.5);
        assert_eq!(safe_div(f64::NAN, 2.0, 0.5), 0.5);
        assert_eq!(safe_div(f64::MAX, 1e-300, 0.5), 0.5);
    }

    #[test]
    fn test_safe_div_regular_quotient() {
        assert_relative_eq!(safe_div(30.0, 60.0, 0.0), 0.5);
        assert_relative_eq!(safe_div(-3.0, 4.0, 0.0), -0.75);
    }

    #[test]
    fn test_layout_indices_are_unique_and_dense() {
        let mut seen = vec![false; FEATURE_COUNT];
        for field in Field::ALL {
            for side in Side::BOTH {
                let i = field.index(side);
                assert!(!seen[i], "index {} used twice", i);
                seen[i] = true;
            }
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_build_replaces_non_finite_with_defaults() {
        let policy = FallbackPolicy::default();
        let v = FeatureVector::build(&policy, |field, _| match field {
            Field::WinPct => Some(f64::NAN),
            Field::GoalsForPerGame => Some(f64::INFINITY),
            Field::TravelKm => Some(850.0),
            _ => None,
        });
        assert_eq!(v.get(Field::WinPct, Side::Home), 0.5);
        assert_eq!(v.get(Field::GoalsForPerGame, Side::Away), 2.8);
        assert_eq!(v.get(Field::TravelKm, Side::Away), 850.0);
        assert!(v.values().iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_sanitized_rejects_wrong_length() {
        let policy = FallbackPolicy::default();
        let bad = FeatureVector {
            version: FEATURE_VERSION,
            values: vec![0.0; 5],
        };
        assert!(bad.sanitized(&policy).is_err());
    }

    #[tokio::test]
    async fn test_extract_without_sources_is_all_defaults() {
        let extractor = FeatureExtractor::new(FallbackPolicy::default(), Duration::from_millis(50));
        let out = extractor.extract("BOS", "TOR", date()).await;
        assert_eq!(out.vector, FeatureVector::defaults(&FallbackPolicy::default()));
        assert_eq!(out.data_quality, 0.0);
        assert_eq!(out.degradations().count(), FeatureGroup::ALL.len() * 2);
    }

    #[tokio::test]
    async fn test_failing_source_degrades_only_its_slice() {
        let extractor = FeatureExtractor::new(FallbackPolicy::default(), Duration::from_millis(50))
            .with_source(Arc::new(FixedSource {
                group: FeatureGroup::GoalieForm,
                values: vec![("save_pct", 0.921), ("goals_saved_above_expected", 4.5)],
            }))
            .with_source(Arc::new(FailingSource(FeatureGroup::PlayerImpact)));

        let out = extractor.extract("BOS", "TOR", date()).await;
        assert_eq!(out.vector.get(Field::GoalieSavePct, Side::Home), 0.921);
        assert_eq!(out.vector.get(Field::LineupStrength, Side::Home), 0.5);
        assert_relative_eq!(out.data_quality, 2.0 / 14.0);

        let failed: Vec<_> = out.degradations().filter(|s| s.provider == "failing").collect();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|s| s.failed));
        assert!(failed[0].reason.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_slow_source_times_out_to_defaults() {
        let extractor = FeatureExtractor::new(FallbackPolicy::default(), Duration::from_millis(20))
            .with_source(Arc::new(SlowSource));
        let out = extractor.extract("BOS", "TOR", date()).await;
        assert_eq!(out.vector.get(Field::MarketImpliedProb, Side::Home), 0.5);
        let slow = out.slices.iter().find(|s| s.provider == "slow").unwrap();
        assert!(!slow.live && slow.failed);
        assert!(slow.reason.as_deref().unwrap().starts_with("timed out"));
    }

    #[tokio::test]
    async fn test_non_finite_signal_is_not_counted_live() {
        let extractor = FeatureExtractor::new(FallbackPolicy::default(), Duration::from_millis(50))
            .with_source(Arc::new(FixedSource {
                group: FeatureGroup::MarketOdds,
                values: vec![("implied_win_prob", f64::NAN)],
            }));
        let out = extractor.extract("BOS", "TOR", date()).await;
        assert_eq!(out.data_quality, 0.0);
        assert_eq!(out.vector.get(Field::MarketImpliedProb, Side::Away), 0.5);
    }

    #[tokio::test]
    async fn test_extraction_is_deterministic() {
        let make = || {
            FeatureExtractor::new(FallbackPolicy::default(), Duration::from_millis(50)).with_source(
                Arc::new(FixedSource {
                    group: FeatureGroup::TravelRest,
                    values: vec![("rest_days", 1.0), ("travel_km", 1200.0)],
                }),
            )
        };
        let a = make().extract("NYR", "NJD", date()).await;
        let b = make().extract("NYR", "NJD", date()).await;
        let bits = |v: &FeatureVector| v.values().iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&a.vector), bits(&b.vector));
    }
}
