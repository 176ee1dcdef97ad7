use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

use super::{
    decisiveness, three_way, Decision, MatchFeatures, MatchResult, ModelKind, ModelState,
    ModelSummary, OutcomeDistribution, PredictionModel,
};
use crate::error::{EngineError, Result};
use crate::features::{Field, Side};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EloParams {
    pub initial_rating: f64,
    pub k_factor: f64,
    /// Rating points added to the home side when computing expectations.
    pub home_advantage: f64,
    /// Rating changes kept per team.
    pub history_len: usize,
}

impl Default for EloParams {
    fn default() -> Self {
        EloParams {
            initial_rating: 1500.0,
            k_factor: 32.0,
            home_advantage: 100.0,
            history_len: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingChange {
    pub match_id: String,
    pub played_on: NaiveDate,
    pub before: f64,
    pub after: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EloState {
    pub ratings: BTreeMap<String, f64>,
    pub games_played: BTreeMap<String, u32>,
    pub history: BTreeMap<String, VecDeque<RatingChange>>,
    pub matches_trained: u64,
}

#[derive(Clone)]
pub struct EloModel {
    params: EloParams,
    tie_share: f64,
    state: EloState,
}

impl EloModel {
    pub fn new(params: EloParams, tie_share: f64) -> Self {
        EloModel {
            params,
            tie_share,
            state: EloState::default(),
        }
    }

    /// Current rating; unseen teams sit at the initial rating.
    pub fn rating(&self, team: &str) -> f64 {
        self.state
            .ratings
            .get(team)
            .copied()
            .unwrap_or(self.params.initial_rating)
    }

    fn games(&self, team: &str) -> u32 {
        self.state.games_played.get(team).copied().unwrap_or(0)
    }

    /// Probability that the home side finishes ahead.
    pub fn expected_home(&self, home: f64, away: f64) -> f64 {
        1.0 / (1.0 + 10f64.powf((away - home - self.params.home_advantage) / 400.0))
    }

    /// K shrinks with experience (never below 70 % of base), shrinks for
    /// overtime/shootout results, grows for blowouts, upsets and high stakes.
    fn dynamic_k(&self, result: &MatchResult, home_rating: f64, away_rating: f64) -> f64 {
        let avg_games =
            (self.games(&result.home_team) as f64 + self.games(&result.away_team) as f64) / 2.0;
        let mut k = self.params.k_factor * (0.7 + 0.3 / (1.0 + avg_games / 30.0));

        if result.decision != Decision::Regulation {
            k *= 0.8;
        }

        let margin = result.margin();
        if margin >= 4 {
            k *= 1.2;
        } else if margin >= 3 {
            k *= 1.1;
        }

        let gap = home_rating - away_rating;
        if gap.abs() > 200.0 {
            let favourite = if gap > 0.0 { Side::Home } else { Side::Away };
            if result.winner() == favourite {
                k *= 0.9;
            } else {
                k *= 1.3;
            }
        }

        if result.high_stakes {
            k *= 1.5;
        }
        k
    }

    fn push_history(&mut self, team: &str, change: RatingChange) {
        let history = self.state.history.entry(team.to_string()).or_default();
        history.push_back(change);
        while history.len() > self.params.history_len {
            history.pop_front();
        }
    }
}

impl PredictionModel for EloModel {
    fn name(&self) -> &str {
        "elo"
    }

    fn kind(&self) -> ModelKind {
        ModelKind::Elo
    }

    fn predict(&self, m: &MatchFeatures) -> Result<OutcomeDistribution> {
        let home = self.rating(&m.home_team);
        let away = self.rating(&m.away_team);
        let expected = self.expected_home(home, away);
        let [p_home_win, p_away_win, p_other] = three_way(expected, self.tie_share);

        let avg_goals = 0.5
            * (m.features.get(Field::GoalsForPerGame, Side::Home)
                + m.features.get(Field::GoalsForPerGame, Side::Away));
        let tilt = expected - 0.5;

        let games = self.games(&m.home_team).min(self.games(&m.away_team)) as f64;
        let experience = games / (games + 10.0);

        Ok(OutcomeDistribution {
            p_home_win,
            p_away_win,
            p_other,
            expected_home_goals: (avg_goals * (1.0 + 0.5 * tilt)).max(0.0),
            expected_away_goals: (avg_goals * (1.0 - 0.5 * tilt)).max(0.0),
            confidence: decisiveness(p_home_win, p_away_win) * (0.5 + 0.5 * experience),
        })
    }

    fn update(&mut self, result: &MatchResult, _features: &MatchFeatures) -> Result<()> {
        let home_before = self.rating(&result.home_team);
        let away_before = self.rating(&result.away_team);
        let expected = self.expected_home(home_before, away_before);

        let actual = match (result.decision, result.winner()) {
            (Decision::Regulation, Side::Home) => 1.0,
            (Decision::Regulation, Side::Away) => 0.0,
            (_, Side::Home) => 0.75,
            (_, Side::Away) => 0.25,
        };

        let k = self.dynamic_k(result, home_before, away_before);
        let delta = k * (actual - expected);
        if !delta.is_finite() {
            return Err(EngineError::degenerate("elo", format!("non-finite rating delta (k={})", k)));
        }

        let home_after = home_before + delta;
        let away_after = away_before - delta;
        debug!(
            "Elo {}: {} {:.1}→{:.1}, {} {:.1}→{:.1} (k={:.1})",
            result.match_id,
            result.home_team,
            home_before,
            home_after,
            result.away_team,
            away_before,
            away_after,
            k
        );

        self.state.ratings.insert(result.home_team.clone(), home_after);
        self.state.ratings.insert(result.away_team.clone(), away_after);
        *self.state.games_played.entry(result.home_team.clone()).or_default() += 1;
        *self.state.games_played.entry(result.away_team.clone()).or_default() += 1;
        self.push_history(
            &result.home_team,
            RatingChange {
                match_id: result.match_id.clone(),
                played_on: result.played_on,
                before: home_before,
                after: home_after,
            },
        );
        self.push_history(
            &result.away_team,
            RatingChange {
                match_id: result.match_id.clone(),
                played_on: result.played_on,
                before: away_before,
                after: away_after,
            },
        );
        self.state.matches_trained += 1;
        Ok(())
    }

    fn snapshot(&self) -> ModelState {
        ModelState::Elo(self.state.clone())
    }

    fn restore(&mut self, state: ModelState) -> Result<()> {
        let ModelState::Elo(state) = state else {
            return Err(EngineError::corrupt(
                "elo",
                format!("expected elo state, found {}", state.kind_name()),
            ));
        };
        if let Some((team, r)) = state.ratings.iter().find(|(_, r)| !r.is_finite()) {
            return Err(EngineError::corrupt("elo", format!("rating for {} is {}", team, r)));
        }
        self.state = state;
        Ok(())
    }

    fn summary(&self) -> ModelSummary {
        let mut ranked: Vec<(&String, &f64)> = self.state.ratings.iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(a.1));
        let top: Vec<_> = ranked
            .iter()
            .take(5)
            .map(|(team, r)| serde_json::json!({ "team": team, "rating": r }))
            .collect();

        ModelSummary {
            name: self.name().to_string(),
            kind: self.kind(),
            trained_matches: self.state.matches_trained,
            details: serde_json::json!({
                "teams_tracked": self.state.ratings.len(),
                "k_factor": self.params.k_factor,
                "home_advantage": self.params.home_advantage,
                "top_ratings": top,
            }),
        }
    }

    fn clone_box(&self) -> Box<dyn PredictionModel> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::{features, result};
    use approx::assert_relative_eq;

    fn model() -> EloModel {
        EloModel::new(EloParams::default(), 0.22)
    }

    #[test]
    fn test_equal_ratings_home_win_is_zero_sum() {
        let mut elo = model();
        let r = result("m1", "BOS", "TOR", 3, 1);
        elo.update(&r, &features("BOS", "TOR")).unwrap();

        let home = elo.rating("BOS");
        let away = elo.rating("TOR");
        assert!(home > 1500.0, "home rating should rise, got {}", home);
        assert!(away < 1500.0, "away rating should fall, got {}", away);
        assert_relative_eq!((home - 1500.0) + (away - 1500.0), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_home_advantage_in_expectation() {
        let elo = model();
        let p = elo.expected_home(1500.0, 1500.0);
        assert_relative_eq!(p, 1.0 / (1.0 + 10f64.powf(-0.25)), epsilon = 1e-12);
        assert!(p > 0.6);
    }

    #[test]
    fn test_overtime_win_moves_less_than_regulation() {
        let mut reg = model();
        let mut ot = model();
        reg.update(&result("m1", "BOS", "TOR", 3, 2), &features("BOS", "TOR")).unwrap();
        let mut r = result("m1", "BOS", "TOR", 3, 2);
        r.decision = Decision::Overtime;
        ot.update(&r, &features("BOS", "TOR")).unwrap();
        assert!(reg.rating("BOS") > ot.rating("BOS"));
    }

    #[test]
    fn test_high_stakes_boosts_k() {
        let mut normal = model();
        let mut playoff = model();
        let mut r = result("m1", "BOS", "TOR", 1, 4);
        normal.update(&r, &features("BOS", "TOR")).unwrap();
        r.high_stakes = true;
        playoff.update(&r, &features("BOS", "TOR")).unwrap();
        assert!(playoff.rating("TOR") > normal.rating("TOR"));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut elo = EloModel::new(
            EloParams {
                history_len: 3,
                ..EloParams::default()
            },
            0.22,
        );
        for i in 0..6 {
            let r = result(&format!("m{}", i), "BOS", "TOR", 3, 1);
            elo.update(&r, &features("BOS", "TOR")).unwrap();
        }
        assert_eq!(elo.state.history["BOS"].len(), 3);
        assert_eq!(elo.state.history["BOS"].back().unwrap().match_id, "m5");
        assert_eq!(elo.state.games_played["TOR"], 6);
    }

    #[test]
    fn test_predict_favours_stronger_team() {
        let mut elo = model();
        for i in 0..5 {
            let r = result(&format!("m{}", i), "TOR", "BOS", 5, 1);
            elo.update(&r, &features("TOR", "BOS")).unwrap();
        }
        let d = elo.predict(&features("BOS", "TOR")).unwrap();
        assert!(d.p_away_win > d.p_home_win);
        d.check("elo").unwrap();
    }

    #[test]
    fn test_restore_rejects_wrong_kind_and_keeps_state() {
        let mut elo = model();
        elo.update(&result("m1", "BOS", "TOR", 3, 1), &features("BOS", "TOR")).unwrap();
        let before = elo.snapshot();
        assert!(elo.restore(ModelState::Stateless).is_err());
        assert_eq!(elo.snapshot(), before);
    }

    #[test]
    fn test_snapshot_restore_reproduces_predictions() {
        let mut elo = model();
        elo.update(&result("m1", "BOS", "TOR", 3, 1), &features("BOS", "TOR")).unwrap();
        let mut fresh = model();
        fresh.restore(elo.snapshot()).unwrap();
        let f = features("BOS", "TOR");
        assert_eq!(elo.predict(&f).unwrap(), fresh.predict(&f).unwrap());
    }
}
