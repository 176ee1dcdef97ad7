use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use tracing::debug;

use super::ResultFeed;
use crate::models::{team_code, Decision, MatchResult};

/// Final scores from the NHL web API (`/score/{date}`).
pub struct NhlScoreFeed {
    http: Client,
    /// Base URL for overriding in tests
    base_url: String,
}

impl NhlScoreFeed {
    pub fn new(base_url: &str, http: Client) -> Self {
        NhlScoreFeed {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ResultFeed for NhlScoreFeed {
    fn name(&self) -> &str {
        "nhl-scores"
    }

    async fn final_results(&self, date: NaiveDate) -> Result<Vec<MatchResult>> {
        let url = format!("{}/score/{}", self.base_url, date.format("%Y-%m-%d"));
        debug!("Fetching scores from {}", url);

        let resp = self.http.get(&url).send().await.context("Score request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("Score API error: {}", resp.status());
        }
        let raw: serde_json::Value = resp.json().await.context("Failed to parse score response")?;

        Ok(parse_scores(&raw, date))
    }
}

/// Finished games only; anything unparseable or tied is skipped.
fn parse_scores(raw: &serde_json::Value, date: NaiveDate) -> Vec<MatchResult> {
    let games = match raw["games"].as_array() {
        Some(a) => a,
        None => return vec![],
    };

    games
        .iter()
        .filter_map(|g| {
            let state = g["gameState"].as_str()?;
            if !matches!(state, "FINAL" | "OFF") {
                return None;
            }
            let match_id = match &g["id"] {
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::String(s) => s.clone(),
                _ => return None,
            };
            let home_team = team_code(g["homeTeam"]["abbrev"].as_str()?);
            let away_team = team_code(g["awayTeam"]["abbrev"].as_str()?);
            let home_score = u32::try_from(g["homeTeam"]["score"].as_u64()?).ok()?;
            let away_score = u32::try_from(g["awayTeam"]["score"].as_u64()?).ok()?;

            let period = g["gameOutcome"]["lastPeriodType"]
                .as_str()
                .or_else(|| g["periodDescriptor"]["periodType"].as_str())
                .unwrap_or("REG");
            let played_on = g["gameDate"]
                .as_str()
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
                .unwrap_or(date);

            let result = MatchResult {
                match_id,
                home_team,
                away_team,
                home_score,
                away_score,
                decision: Decision::parse(period).unwrap_or(Decision::Regulation),
                played_on,
                // Playoff games.
                high_stakes: g["gameType"].as_u64() == Some(3),
            };
            result.validate().ok().map(|_| result)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
    }

    fn game(id: u64, state: &str, home: (&str, u64), away: (&str, u64), period: &str) -> serde_json::Value {
        json!({
            "id": id,
            "gameType": 2,
            "gameDate": "2025-01-15",
            "gameState": state,
            "homeTeam": { "abbrev": home.0, "score": home.1 },
            "awayTeam": { "abbrev": away.0, "score": away.1 },
            "periodDescriptor": { "number": 3, "periodType": period }
        })
    }

    #[test]
    fn test_only_final_games_are_returned() {
        let raw = json!({ "games": [
            game(1, "OFF", ("BOS", 4), ("TOR", 2), "REG"),
            game(2, "LIVE", ("MTL", 1), ("NYR", 0), "REG"),
            game(3, "FUT", ("EDM", 0), ("CGY", 0), "REG"),
        ]});
        let results = parse_scores(&raw, day());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].match_id, "1");
        assert_eq!(results[0].home_score, 4);
        assert_eq!(results[0].decision, Decision::Regulation);
    }

    #[test]
    fn test_overtime_and_shootout_decisions() {
        let mut so = game(5, "FINAL", ("EDM", 2), ("CGY", 3), "SO");
        so["gameOutcome"] = json!({ "lastPeriodType": "SO" });
        let raw = json!({ "games": [game(4, "FINAL", ("BOS", 3), ("TOR", 2), "OT"), so] });
        let results = parse_scores(&raw, day());
        assert_eq!(results[0].decision, Decision::Overtime);
        assert_eq!(results[1].decision, Decision::Shootout);
    }

    #[test]
    fn test_playoff_game_is_high_stakes() {
        let mut g = game(7, "OFF", ("FLA", 1), ("EDM", 0), "REG");
        g["gameType"] = json!(3);
        let results = parse_scores(&json!({ "games": [g] }), day());
        assert!(results[0].high_stakes);
    }

    #[test]
    fn test_tied_or_malformed_games_are_skipped() {
        let mut missing = game(9, "OFF", ("BOS", 2), ("TOR", 1), "REG");
        missing["homeTeam"] = json!({ "abbrev": "BOS" });
        let raw = json!({ "games": [game(8, "OFF", ("BOS", 2), ("TOR", 2), "REG"), missing] });
        assert!(parse_scores(&raw, day()).is_empty());
        assert!(parse_scores(&json!({}), day()).is_empty());
    }

    #[test]
    fn test_score_beyond_u32_is_skipped() {
        // Narrowing 2^32 + 3 would turn this into a 3-2 home win.
        let raw = json!({ "games": [
            game(10, "OFF", ("BOS", 4_294_967_299), ("TOR", 2), "REG"),
            game(11, "OFF", ("MTL", 3), ("NYR", 1), "REG"),
        ]});
        let results = parse_scores(&raw, day());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].match_id, "11");
    }
}
