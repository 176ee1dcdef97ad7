use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{safe_div, FallbackPolicy, Field};

/// Season-to-date record of one team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamSeasonStanding {
    pub team: String,
    pub games_played: u32,
    pub wins: u32,
    pub losses: u32,
    pub ot_losses: u32,
    pub goals_for: u32,
    pub goals_against: u32,
}

impl TeamSeasonStanding {
    pub fn win_pct(&self, policy: &FallbackPolicy) -> f64 {
        safe_div(self.wins as f64, self.games_played as f64, policy.default_win_pct)
    }

    pub fn goals_for_per_game(&self, policy: &FallbackPolicy) -> f64 {
        safe_div(self.goals_for as f64, self.games_played as f64, policy.league_avg_goals)
    }

    pub fn goals_against_per_game(&self, policy: &FallbackPolicy) -> f64 {
        safe_div(self.goals_against as f64, self.games_played as f64, policy.league_avg_goals)
    }

    /// Two points per win, one per overtime loss.
    pub fn points_pct(&self, policy: &FallbackPolicy) -> f64 {
        let points = 2.0 * self.wins as f64 + self.ot_losses as f64;
        safe_div(points, 2.0 * self.games_played as f64, policy.default_win_pct)
    }

    /// Standings slice of the feature vector, keyed by `Field::key()`.
    pub fn signals(&self, policy: &FallbackPolicy) -> BTreeMap<String, f64> {
        BTreeMap::from([
            (Field::WinPct.key().to_string(), self.win_pct(policy)),
            (Field::GoalsForPerGame.key().to_string(), self.goals_for_per_game(policy)),
            (Field::GoalsAgainstPerGame.key().to_string(), self.goals_against_per_game(policy)),
            (Field::PointsPct.key().to_string(), self.points_pct(policy)),
        ])
    }
}

/// Source of season standings.
#[async_trait]
pub trait StandingsProvider: Send + Sync {
    /// Standing of `team` as of `date`, or `None` if the team is unknown.
    async fn standing(&self, team: &str, date: NaiveDate) -> Result<Option<TeamSeasonStanding>>;

    fn name(&self) -> &str;
}

// ── NHL web API ───────────────────────────────────────────────────────────────

const MAX_CACHED_DATES: usize = 8;

/// Standings from the NHL web API (`/standings/{date}`).  One request returns
/// the whole league, so tables are cached per date.
pub struct NhlStandingsClient {
    http: Client,
    base_url: String,
    tables: Mutex<HashMap<NaiveDate, Arc<HashMap<String, TeamSeasonStanding>>>>,
}

impl NhlStandingsClient {
    pub fn new(base_url: &str, http: Client) -> Self {
        NhlStandingsClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// The league table for `date`.  The cache lock is never held across
    /// the HTTP request, so lookups for cached dates stay fast while a fetch
    /// is in flight.
    async fn table(&self, date: NaiveDate) -> Result<Arc<HashMap<String, TeamSeasonStanding>>> {
        if let Some(t) = self.tables.lock().await.get(&date) {
            return Ok(Arc::clone(t));
        }
        let table = self.fetch_table(date).await?;
        info!("Loaded standings for {} teams ({})", table.len(), date);
        Ok(self.remember(date, Arc::new(table)).await)
    }

    async fn fetch_table(&self, date: NaiveDate) -> Result<HashMap<String, TeamSeasonStanding>> {
        let url = format!("{}/standings/{}", self.base_url, date.format("%Y-%m-%d"));
        debug!("Fetching standings from {}", url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("Standings request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("Standings API error: {}", resp.status());
        }
        let raw: serde_json::Value = resp
            .json()
            .await
            .context("Failed to parse standings response")?;

        Ok(parse_standings(&raw))
    }

    /// Cache a fetched table.  If a concurrent fetch got there first, its
    /// table wins.
    async fn remember(
        &self,
        date: NaiveDate,
        table: Arc<HashMap<String, TeamSeasonStanding>>,
    ) -> Arc<HashMap<String, TeamSeasonStanding>> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables.get(&date) {
            return Arc::clone(existing);
        }
        if tables.len() >= MAX_CACHED_DATES {
            tables.clear();
        }
        tables.insert(date, Arc::clone(&table));
        table
    }
}

#[async_trait]
impl StandingsProvider for NhlStandingsClient {
    async fn standing(&self, team: &str, date: NaiveDate) -> Result<Option<TeamSeasonStanding>> {
        let table = self.table(date).await?;
        Ok(table.get(&team.to_uppercase()).cloned())
    }

    fn name(&self) -> &str {
        "nhl-standings"
    }
}

fn parse_standings(raw: &serde_json::Value) -> HashMap<String, TeamSeasonStanding> {
    let rows = match raw["standings"].as_array() {
        Some(a) => a,
        None => return HashMap::new(),
    };

    // Absent counts read as zero; present ones must fit or the row is dropped.
    let count = |row: &serde_json::Value, key: &str| -> Option<u32> {
        match &row[key] {
            serde_json::Value::Null => Some(0),
            v => v.as_u64().and_then(|n| u32::try_from(n).ok()),
        }
    };

    rows.iter()
        .filter_map(|row| {
            let team = row["teamAbbrev"]["default"]
                .as_str()
                .or_else(|| row["teamAbbrev"].as_str())?
                .to_uppercase();
            Some((
                team.clone(),
                TeamSeasonStanding {
                    team,
                    games_played: count(row, "gamesPlayed")?,
                    wins: count(row, "wins")?,
                    losses: count(row, "losses")?,
                    ot_losses: count(row, "otLosses")?,
                    goals_for: count(row, "goalFor")?,
                    goals_against: count(row, "goalAgainst")?,
                },
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use serde_json::json;

    fn standing(gp: u32, w: u32, otl: u32, gf: u32, ga: u32) -> TeamSeasonStanding {
        TeamSeasonStanding {
            team: "BOS".into(),
            games_played: gp,
            wins: w,
            losses: gp.saturating_sub(w + otl),
            ot_losses: otl,
            goals_for: gf,
            goals_against: ga,
        }
    }

    #[test]
    fn test_zero_games_uses_domain_defaults() {
        let policy = FallbackPolicy::default();
        let s = standing(0, 0, 0, 0, 0);
        assert_eq!(s.win_pct(&policy), 0.5);
        assert_eq!(s.goals_for_per_game(&policy), 2.8);
        assert_eq!(s.goals_against_per_game(&policy), 2.8);
        assert_eq!(s.points_pct(&policy), 0.5);
    }

    #[test]
    fn test_ratios_for_played_games() {
        let policy = FallbackPolicy::default();
        let s = standing(40, 24, 6, 132, 108);
        assert_relative_eq!(s.win_pct(&policy), 0.6);
        assert_relative_eq!(s.goals_for_per_game(&policy), 3.3);
        assert_relative_eq!(s.goals_against_per_game(&policy), 2.7);
        assert_relative_eq!(s.points_pct(&policy), 54.0 / 80.0);
    }

    #[test]
    fn test_signals_use_field_keys() {
        let s = standing(10, 5, 1, 30, 25).signals(&FallbackPolicy::default());
        assert_eq!(s.len(), 4);
        assert!(s.contains_key("win_pct"));
        assert!(s.contains_key("goals_against_per_game"));
    }

    #[test]
    fn test_parse_standings_rows() {
        let raw = json!({
            "standings": [
                { "teamAbbrev": { "default": "bos" }, "gamesPlayed": 20, "wins": 12,
                  "losses": 6, "otLosses": 2, "goalFor": 64, "goalAgainst": 50 },
                { "gamesPlayed": 20 }
            ]
        });
        let table = parse_standings(&raw);
        assert_eq!(table.len(), 1);
        let bos = &table["BOS"];
        assert_eq!(bos.wins, 12);
        assert_eq!(bos.goals_for, 64);
    }

    #[test]
    fn test_parse_standings_drops_out_of_range_counts() {
        let raw = json!({
            "standings": [
                { "teamAbbrev": { "default": "BOS" }, "gamesPlayed": 4_294_967_297u64, "wins": 1 },
                { "teamAbbrev": { "default": "TOR" }, "gamesPlayed": 20, "wins": -3 },
                { "teamAbbrev": { "default": "MTL" }, "gamesPlayed": 20, "wins": 9 }
            ]
        });
        let table = parse_standings(&raw);
        assert_eq!(table.len(), 1);
        assert_eq!(table["MTL"].wins, 9);
        assert_eq!(table["MTL"].losses, 0);
    }

    #[tokio::test]
    async fn test_cached_date_is_served_while_another_fetch_is_pending() {
        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if let Ok((socket, _)) = listener.accept().await {
                    held.push(socket);
                }
            }
        });

        let client = Arc::new(NhlStandingsClient::new(&format!("http://{}", addr), Client::new()));
        let cached_day = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        let table = HashMap::from([("BOS".to_string(), standing(10, 5, 1, 30, 25))]);
        client.remember(cached_day, Arc::new(table)).await;

        let pending = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.standing("TOR", NaiveDate::from_ymd_opt(2025, 1, 11).unwrap()).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let hit = tokio::time::timeout(std::time::Duration::from_millis(500), client.standing("bos", cached_day))
            .await
            .expect("cached lookup waited on the pending fetch")
            .unwrap();
        assert_eq!(hit.map(|s| s.wins), Some(5));
        assert!(!pending.is_finished());

        pending.abort();
        server.abort();
    }

    #[tokio::test]
    async fn test_remember_keeps_first_table() {
        let client = NhlStandingsClient::new("http://127.0.0.1:9", Client::new());
        let day = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        let first = Arc::new(HashMap::from([("BOS".to_string(), standing(10, 5, 1, 30, 25))]));
        client.remember(day, Arc::clone(&first)).await;
        let second = client.remember(day, Arc::new(HashMap::new())).await;
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_parse_standings_missing_array() {
        assert!(parse_standings(&json!({ "error": "nope" })).is_empty());
    }
}
