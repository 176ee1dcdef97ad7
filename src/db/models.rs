use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A completed match as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub match_id: String,
    pub home_team: String,
    pub away_team: String,
    pub home_score: u32,
    pub away_score: u32,
    /// "regulation" | "overtime" | "shootout"
    pub decision: String,
    pub played_on: NaiveDate,
    pub processed_at: DateTime<Utc>,
}

impl MatchRecord {
    pub fn involves(&self, team: &str) -> bool {
        self.home_team == team || self.away_team == team
    }

    /// (goals for, goals against) from `team`'s point of view.
    pub fn goals_for_against(&self, team: &str) -> (u32, u32) {
        if self.home_team == team {
            (self.home_score, self.away_score)
        } else {
            (self.away_score, self.home_score)
        }
    }

    pub fn won(&self, team: &str) -> bool {
        let (gf, ga) = self.goals_for_against(team);
        self.involves(team) && gf > ga
    }
}

/// One row of the prediction audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionLogEntry {
    pub id: i64,
    pub match_id: String,
    pub home_team: String,
    pub away_team: String,
    pub predicted_winner: String,
    pub p_home_win: f64,
    pub p_away_win: f64,
    pub p_other: f64,
    pub confidence: f64,
    pub data_quality: f64,
    /// "live" | "cached" | "degraded"
    pub source: String,
    pub generated_at: DateTime<Utc>,
}
