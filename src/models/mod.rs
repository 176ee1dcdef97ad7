//! Prediction models.
//!
//! Every model implements [`PredictionModel`]: a pure `predict` over its
//! current state, an `update` from a completed match, and whole-state
//! `snapshot`/`restore` for persistence.  Models never share state; the
//! engine wraps each one in its own lock.

pub mod bayesian;
pub mod elo;
pub mod monte_carlo;
pub mod neural;
pub mod poisson;
pub mod statistical;

pub use bayesian::BayesianModel;
pub use elo::EloModel;
pub use monte_carlo::MonteCarloModel;
pub use neural::NeuralNetModel;
pub use poisson::PoissonModel;
pub use statistical::StatisticalModel;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::features::{FeatureVector, Side};

// ── Match data ────────────────────────────────────────────────────────────────

/// How a completed match was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Regulation,
    Overtime,
    Shootout,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Regulation => "regulation",
            Decision::Overtime => "overtime",
            Decision::Shootout => "shootout",
        }
    }

    pub fn parse(s: &str) -> Option<Decision> {
        match s.to_ascii_lowercase().as_str() {
            "regulation" | "reg" => Some(Decision::Regulation),
            "overtime" | "ot" => Some(Decision::Overtime),
            "shootout" | "so" => Some(Decision::Shootout),
            _ => None,
        }
    }
}

fn regulation() -> Decision {
    Decision::Regulation
}

/// Three-way outcome: a regulation win for either side, or "other" when the
/// match was still tied after regulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    HomeWin,
    AwayWin,
    Other,
}

impl Outcome {
    pub fn index(self) -> usize {
        match self {
            Outcome::HomeWin => 0,
            Outcome::AwayWin => 1,
            Outcome::Other => 2,
        }
    }
}

/// A completed match from the result feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub match_id: String,
    pub home_team: String,
    pub away_team: String,
    pub home_score: u32,
    pub away_score: u32,
    #[serde(default = "regulation")]
    pub decision: Decision,
    pub played_on: NaiveDate,
    /// Playoff or otherwise elevated-stakes match.
    #[serde(default)]
    pub high_stakes: bool,
}

/// Canonical form of a team code: trimmed, upper case.
pub fn team_code(raw: &str) -> String {
    raw.trim().to_uppercase()
}

impl MatchResult {
    /// Copy with the match id trimmed and both team codes canonical, so
    /// "bos" and "BOS" train the same team.
    pub fn normalized(&self) -> MatchResult {
        MatchResult {
            match_id: self.match_id.trim().to_string(),
            home_team: team_code(&self.home_team),
            away_team: team_code(&self.away_team),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.match_id.trim().is_empty() {
            return Err(EngineError::InvalidResult("empty match id".into()));
        }
        if self.home_team.trim().is_empty() || self.away_team.trim().is_empty() {
            return Err(EngineError::InvalidResult(format!(
                "match {}: missing team code",
                self.match_id
            )));
        }
        if self.home_team.eq_ignore_ascii_case(&self.away_team) {
            return Err(EngineError::InvalidResult(format!(
                "match {}: team {} cannot play itself",
                self.match_id, self.home_team
            )));
        }
        if self.home_score == self.away_score {
            return Err(EngineError::InvalidResult(format!(
                "match {}: final score {}-{} has no winner",
                self.match_id, self.home_score, self.away_score
            )));
        }
        Ok(())
    }

    pub fn winner(&self) -> Side {
        if self.home_score > self.away_score {
            Side::Home
        } else {
            Side::Away
        }
    }

    pub fn outcome(&self) -> Outcome {
        match (self.decision, self.winner()) {
            (Decision::Regulation, Side::Home) => Outcome::HomeWin,
            (Decision::Regulation, Side::Away) => Outcome::AwayWin,
            _ => Outcome::Other,
        }
    }

    pub fn margin(&self) -> u32 {
        self.home_score.abs_diff(self.away_score)
    }
}

/// Everything a model sees about an upcoming or completed match.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchFeatures {
    pub home_team: String,
    pub away_team: String,
    pub features: FeatureVector,
}

// ── Model output ──────────────────────────────────────────────────────────────

/// Probability distribution over the three outcomes plus expected goals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutcomeDistribution {
    pub p_home_win: f64,
    pub p_away_win: f64,
    pub p_other: f64,
    pub expected_home_goals: f64,
    pub expected_away_goals: f64,
    pub confidence: f64,
}

impl OutcomeDistribution {
    pub fn probabilities(&self) -> [f64; 3] {
        [self.p_home_win, self.p_away_win, self.p_other]
    }

    /// Reject NaN/∞ and out-of-range values so a broken model is excluded
    /// from the blend instead of poisoning it.
    pub fn check(&self, model: &str) -> Result<()> {
        let all = [
            self.p_home_win,
            self.p_away_win,
            self.p_other,
            self.expected_home_goals,
            self.expected_away_goals,
            self.confidence,
        ];
        if all.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::degenerate(model, format!("non-finite output {:?}", self)));
        }
        if self.probabilities().iter().any(|p| !(0.0..=1.0).contains(p)) {
            return Err(EngineError::degenerate(model, "probability outside [0, 1]"));
        }
        let sum: f64 = self.probabilities().iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(EngineError::degenerate(model, format!("probabilities sum to {:.6}", sum)));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(EngineError::degenerate(model, "confidence outside [0, 1]"));
        }
        if self.expected_home_goals < 0.0 || self.expected_away_goals < 0.0 {
            return Err(EngineError::degenerate(model, "negative expected goals"));
        }
        Ok(())
    }

    /// Brier score of this distribution against the realised outcome.
    pub fn brier(&self, actual: Outcome) -> f64 {
        self.probabilities()
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let y = if i == actual.index() { 1.0 } else { 0.0 };
                (p - y).powi(2)
            })
            .sum()
    }
}

/// Split "home wins" / "away wins" probabilities (any decision) into the
/// three-way distribution, giving `tie_share` of the mass to regulation ties.
pub(crate) fn three_way(p_home_any: f64, tie_share: f64) -> [f64; 3] {
    let p_home_any = p_home_any.clamp(0.0, 1.0);
    let tie = tie_share.clamp(0.0, 0.9);
    [p_home_any * (1.0 - tie), (1.0 - p_home_any) * (1.0 - tie), tie]
}

/// Confidence from how decisive a distribution is: 0 for a coin flip
/// between the two sides, approaching 1 when one side dominates.
pub(crate) fn decisiveness(p_home: f64, p_away: f64) -> f64 {
    let total = p_home + p_away;
    if total <= 0.0 || !total.is_finite() {
        return 0.0;
    }
    ((p_home - p_away).abs() / total).clamp(0.0, 1.0)
}

// ── State & trait ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Elo,
    Poisson,
    NeuralNet,
    Bayesian,
    MonteCarlo,
    Statistical,
}

/// Learned parameters of one model, persisted as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelState {
    Elo(elo::EloState),
    Poisson(poisson::PoissonState),
    NeuralNet(neural::NeuralState),
    Bayesian(bayesian::BayesianState),
    Stateless,
}

impl ModelState {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ModelState::Elo(_) => "elo",
            ModelState::Poisson(_) => "poisson",
            ModelState::NeuralNet(_) => "neural_net",
            ModelState::Bayesian(_) => "bayesian",
            ModelState::Stateless => "stateless",
        }
    }
}

/// Human-facing description of a model's current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSummary {
    pub name: String,
    pub kind: ModelKind,
    pub trained_matches: u64,
    pub details: serde_json::Value,
}

pub trait PredictionModel: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ModelKind;

    /// Pure with respect to the model's current state.
    fn predict(&self, features: &MatchFeatures) -> Result<OutcomeDistribution>;

    /// Learn from a completed match.  The engine guarantees a match id is
    /// applied at most once.
    fn update(&mut self, result: &MatchResult, features: &MatchFeatures) -> Result<()>;

    fn snapshot(&self) -> ModelState;

    /// Replace the whole state.  Incompatible state is rejected and the
    /// current state kept.
    fn restore(&mut self, state: ModelState) -> Result<()>;

    fn summary(&self) -> ModelSummary;

    fn clone_box(&self) -> Box<dyn PredictionModel>;
}

/// The production model set with default parameters.
pub fn default_models(settings: &ModelSettings) -> Vec<Box<dyn PredictionModel>> {
    vec![
        Box::new(StatisticalModel::new(settings.tie_share)),
        Box::new(EloModel::new(settings.elo.clone(), settings.tie_share)),
        Box::new(PoissonModel::new(settings.poisson.clone())),
        Box::new(BayesianModel::new(settings.bayesian.clone(), settings.tie_share)),
        Box::new(MonteCarloModel::new(settings.league_avg_goals, settings.simulations)),
        Box::new(NeuralNetModel::new(settings.neural_seed)),
    ]
}

/// Tunables for the model set.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub elo: elo::EloParams,
    pub poisson: poisson::PoissonParams,
    pub bayesian: bayesian::BayesianParams,
    pub league_avg_goals: f64,
    /// Share of probability mass assigned to regulation ties by the
    /// models that only estimate who wins.
    pub tie_share: f64,
    pub simulations: usize,
    pub neural_seed: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        ModelSettings {
            elo: elo::EloParams::default(),
            poisson: poisson::PoissonParams::default(),
            bayesian: bayesian::BayesianParams::default(),
            league_avg_goals: 2.8,
            tie_share: 0.22,
            simulations: 2000,
            neural_seed: 42,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::features::{FallbackPolicy, Field};
    use approx::assert_relative_eq;

    pub(crate) fn features(home: &str, away: &str) -> MatchFeatures {
        MatchFeatures {
            home_team: home.into(),
            away_team: away.into(),
            features: FeatureVector::defaults(&FallbackPolicy::default()),
        }
    }

    /// Features where the home side is clearly stronger.
    pub(crate) fn strong_home(home: &str, away: &str) -> MatchFeatures {
        let policy = FallbackPolicy::default();
        let vector = FeatureVector::build(&policy, |field, side| {
            let home = side == Side::Home;
            match field {
                Field::WinPct | Field::PointsPct | Field::FormWinPct => Some(if home { 0.7 } else { 0.35 }),
                Field::GoalsForPerGame => Some(if home { 3.6 } else { 2.4 }),
                Field::GoalsAgainstPerGame => Some(if home { 2.3 } else { 3.4 }),
                Field::GoalieSavePct => Some(if home { 0.925 } else { 0.890 }),
                Field::FormGoalDiff => Some(if home { 1.2 } else { -0.9 }),
                Field::LineupStrength => Some(if home { 0.8 } else { 0.4 }),
                _ => None,
            }
        });
        MatchFeatures {
            home_team: home.into(),
            away_team: away.into(),
            features: vector,
        }
    }

    pub(crate) fn result(id: &str, home: &str, away: &str, hs: u32, aws: u32) -> MatchResult {
        MatchResult {
            match_id: id.into(),
            home_team: home.into(),
            away_team: away.into(),
            home_score: hs,
            away_score: aws,
            decision: Decision::Regulation,
            played_on: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            high_stakes: false,
        }
    }

    #[test]
    fn test_outcome_from_decision() {
        let mut r = result("m1", "BOS", "TOR", 4, 2);
        assert_eq!(r.outcome(), Outcome::HomeWin);
        r.decision = Decision::Overtime;
        assert_eq!(r.outcome(), Outcome::Other);
        assert_eq!(r.winner(), Side::Home);
        let r = result("m2", "BOS", "TOR", 1, 3);
        assert_eq!(r.outcome(), Outcome::AwayWin);
        assert_eq!(r.margin(), 2);
    }

    #[test]
    fn test_validate_rejects_ties_and_self_play() {
        assert!(result("m1", "BOS", "TOR", 2, 2).validate().is_err());
        assert!(result("m1", "BOS", "bos", 3, 2).validate().is_err());
        assert!(result("", "BOS", "TOR", 3, 2).validate().is_err());
        assert!(result("m1", "BOS", "TOR", 3, 2).validate().is_ok());
    }

    #[test]
    fn test_normalized_canonicalises_team_codes() {
        let r = result(" g7 ", " bos", "Tor ", 3, 2).normalized();
        assert_eq!(r.match_id, "g7");
        assert_eq!(r.home_team, "BOS");
        assert_eq!(r.away_team, "TOR");
        assert_eq!(r.home_score, 3);
    }

    #[test]
    fn test_check_rejects_non_finite_and_bad_sums() {
        let good = OutcomeDistribution {
            p_home_win: 0.4,
            p_away_win: 0.35,
            p_other: 0.25,
            expected_home_goals: 3.0,
            expected_away_goals: 2.6,
            confidence: 0.3,
        };
        assert!(good.check("t").is_ok());
        assert!(OutcomeDistribution { p_home_win: f64::NAN, ..good }.check("t").is_err());
        assert!(OutcomeDistribution { p_home_win: 0.6, ..good }.check("t").is_err());
        assert!(OutcomeDistribution { confidence: 1.5, ..good }.check("t").is_err());
    }

    #[test]
    fn test_brier_perfect_and_worst() {
        let d = OutcomeDistribution {
            p_home_win: 1.0,
            p_away_win: 0.0,
            p_other: 0.0,
            expected_home_goals: 3.0,
            expected_away_goals: 1.0,
            confidence: 1.0,
        };
        assert_relative_eq!(d.brier(Outcome::HomeWin), 0.0);
        assert_relative_eq!(d.brier(Outcome::AwayWin), 2.0);
    }

    #[test]
    fn test_three_way_sums_to_one() {
        let [h, a, o] = three_way(0.62, 0.22);
        assert_relative_eq!(h + a + o, 1.0, epsilon = 1e-12);
        assert!(h > a);
    }

    #[test]
    fn test_default_models_have_unique_names() {
        let models = default_models(&ModelSettings::default());
        let mut names: Vec<_> = models.iter().map(|m| m.name().to_string()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 6);
    }
}
