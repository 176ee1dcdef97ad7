//! Signal sources derived from the processed-match ledger.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

use super::{safe_div, FeatureGroup, Field, SignalQuery, SignalSource};
use crate::db::models::MatchRecord;
use crate::db::Database;

const WINDOW: i64 = 10;

/// Win % and goal differential per game over a team's last ten results.
pub struct RollingFormSource {
    db: Database,
}

impl RollingFormSource {
    pub fn new(db: Database) -> Self {
        RollingFormSource { db }
    }
}

/// The same two numbers restricted to meetings with the opponent.
pub struct MatchupHistorySource {
    db: Database,
}

impl MatchupHistorySource {
    pub fn new(db: Database) -> Self {
        MatchupHistorySource { db }
    }
}

fn summarize(team: &str, records: &[MatchRecord], win_key: Field, diff_key: Field) -> Option<BTreeMap<String, f64>> {
    if records.is_empty() {
        return None;
    }
    let n = records.len() as f64;
    let wins = records.iter().filter(|r| r.won(team)).count() as f64;
    let diff: i64 = records
        .iter()
        .map(|r| {
            let (gf, ga) = r.goals_for_against(team);
            gf as i64 - ga as i64
        })
        .sum();
    Some(BTreeMap::from([
        (win_key.key().to_string(), safe_div(wins, n, 0.5)),
        (diff_key.key().to_string(), safe_div(diff as f64, n, 0.0)),
    ]))
}

#[async_trait]
impl SignalSource for RollingFormSource {
    fn group(&self) -> FeatureGroup {
        FeatureGroup::RollingForm
    }

    fn name(&self) -> &str {
        "ledger-form"
    }

    async fn fetch(&self, query: &SignalQuery) -> Result<Option<BTreeMap<String, f64>>> {
        let records = self.db.recent_results(&query.team, query.as_of, WINDOW)?;
        Ok(summarize(&query.team, &records, Field::FormWinPct, Field::FormGoalDiff))
    }
}

#[async_trait]
impl SignalSource for MatchupHistorySource {
    fn group(&self) -> FeatureGroup {
        FeatureGroup::MatchupHistory
    }

    fn name(&self) -> &str {
        "ledger-matchups"
    }

    async fn fetch(&self, query: &SignalQuery) -> Result<Option<BTreeMap<String, f64>>> {
        let records = self
            .db
            .head_to_head(&query.team, &query.opponent, query.as_of, WINDOW)?;
        Ok(summarize(&query.team, &records, Field::MatchupWinPct, Field::MatchupGoalDiff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::Side;
    use crate::models::{Decision, MatchResult};
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn claim(db: &Database, id: &str, home: &str, away: &str, hs: u32, aws: u32, day: u32) {
        db.claim_match(&MatchResult {
            match_id: id.into(),
            home_team: home.into(),
            away_team: away.into(),
            home_score: hs,
            away_score: aws,
            decision: Decision::Regulation,
            played_on: NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
            high_stakes: false,
        })
        .unwrap();
    }

    fn query(team: &str, opponent: &str) -> SignalQuery {
        SignalQuery {
            team: team.into(),
            opponent: opponent.into(),
            side: Side::Home,
            as_of: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_rolling_form_from_ledger() {
        let db = Database::open_in_memory().unwrap();
        claim(&db, "m1", "BOS", "TOR", 4, 1, 3);
        claim(&db, "m2", "MTL", "BOS", 3, 2, 5);
        let source = RollingFormSource::new(db);
        let s = source.fetch(&query("BOS", "NYR")).await.unwrap().unwrap();
        assert_relative_eq!(s["win_pct"], 0.5);
        assert_relative_eq!(s["goal_diff_per_game"], 1.0);
    }

    #[tokio::test]
    async fn test_no_history_is_unavailable() {
        let db = Database::open_in_memory().unwrap();
        let source = MatchupHistorySource::new(db);
        assert!(source.fetch(&query("BOS", "TOR")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_matchup_history_only_counts_meetings() {
        let db = Database::open_in_memory().unwrap();
        claim(&db, "m1", "BOS", "TOR", 4, 1, 3);
        claim(&db, "m2", "BOS", "MTL", 0, 6, 4);
        let source = MatchupHistorySource::new(db);
        let s = source.fetch(&query("TOR", "BOS")).await.unwrap().unwrap();
        assert_relative_eq!(s["win_pct"], 0.0);
        assert_relative_eq!(s["goal_diff_per_game"], -3.0);
    }
}
