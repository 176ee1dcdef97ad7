use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cache::PredictionSource;
use crate::ensemble::Prediction;
use crate::error::{EngineError, Result};
use crate::models::MatchResult;

pub mod models;
use models::*;

/// Thread-safe SQLite ledger (single connection with mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| EngineError::LedgerPoisoned)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Processed matches ─────────────────────────────────────────────────────

    /// Record a result as processed.  Returns `false` if the match id was
    /// already in the ledger, in which case nothing is written.
    pub fn claim_match(&self, result: &MatchResult) -> Result<bool> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO processed_matches (
                match_id, home_team, away_team, home_score, away_score,
                decision, played_on, high_stakes, processed_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                result.match_id,
                result.home_team,
                result.away_team,
                result.home_score,
                result.away_score,
                result.decision.as_str(),
                result.played_on,
                result.high_stakes,
                Utc::now(),
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn is_processed(&self, match_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM processed_matches WHERE match_id = ?1",
                params![match_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn processed_count(&self) -> Result<u64> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM processed_matches", [], |r| r.get(0))?;
        Ok(n.max(0) as u64)
    }

    /// Most recent results involving `team` played strictly before `before`.
    pub fn recent_results(&self, team: &str, before: NaiveDate, limit: i64) -> Result<Vec<MatchRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT match_id, home_team, away_team, home_score, away_score,
                    decision, played_on, processed_at
             FROM processed_matches
             WHERE (home_team = ?1 OR away_team = ?1) AND played_on < ?2
             ORDER BY played_on DESC, processed_at DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![team, before, limit], map_match_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Most recent meetings between two teams (either venue) before `before`.
    pub fn head_to_head(
        &self,
        team: &str,
        opponent: &str,
        before: NaiveDate,
        limit: i64,
    ) -> Result<Vec<MatchRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT match_id, home_team, away_team, home_score, away_score,
                    decision, played_on, processed_at
             FROM processed_matches
             WHERE ((home_team = ?1 AND away_team = ?2) OR (home_team = ?2 AND away_team = ?1))
               AND played_on < ?3
             ORDER BY played_on DESC, processed_at DESC LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(params![team, opponent, before, limit], map_match_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Prediction log ────────────────────────────────────────────────────────

    pub fn log_prediction(&self, p: &Prediction, source: PredictionSource) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO prediction_log (
                match_id, home_team, away_team, predicted_winner,
                p_home_win, p_away_win, p_other, confidence, data_quality,
                source, generated_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                p.match_id,
                p.home_team,
                p.away_team,
                p.predicted_winner,
                p.p_home_win,
                p.p_away_win,
                p.p_other,
                p.confidence,
                p.data_quality,
                source.as_str(),
                p.generated_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn recent_predictions(&self, limit: i64) -> Result<Vec<PredictionLogEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, match_id, home_team, away_team, predicted_winner,
                    p_home_win, p_away_win, p_other, confidence, data_quality,
                    source, generated_at
             FROM prediction_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(PredictionLogEntry {
                    id: row.get(0)?,
                    match_id: row.get(1)?,
                    home_team: row.get(2)?,
                    away_team: row.get(3)?,
                    predicted_winner: row.get(4)?,
                    p_home_win: row.get(5)?,
                    p_away_win: row.get(6)?,
                    p_other: row.get(7)?,
                    confidence: row.get(8)?,
                    data_quality: row.get(9)?,
                    source: row.get(10)?,
                    generated_at: row.get(11)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn map_match_record(row: &rusqlite::Row) -> rusqlite::Result<MatchRecord> {
    Ok(MatchRecord {
        match_id: row.get(0)?,
        home_team: row.get(1)?,
        away_team: row.get(2)?,
        home_score: row.get(3)?,
        away_score: row.get(4)?,
        decision: row.get(5)?,
        played_on: row.get(6)?,
        processed_at: row.get(7)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS processed_matches (
    match_id     TEXT    PRIMARY KEY,
    home_team    TEXT    NOT NULL,
    away_team    TEXT    NOT NULL,
    home_score   INTEGER NOT NULL,
    away_score   INTEGER NOT NULL,
    decision     TEXT    NOT NULL DEFAULT 'regulation',
    played_on    TEXT    NOT NULL,
    high_stakes  INTEGER NOT NULL DEFAULT 0,
    processed_at TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS prediction_log (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    match_id         TEXT    NOT NULL,
    home_team        TEXT    NOT NULL,
    away_team        TEXT    NOT NULL,
    predicted_winner TEXT    NOT NULL,
    p_home_win       REAL    NOT NULL,
    p_away_win       REAL    NOT NULL,
    p_other          REAL    NOT NULL,
    confidence       REAL    NOT NULL,
    data_quality     REAL    NOT NULL,
    source           TEXT    NOT NULL,
    generated_at     TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_processed_home ON processed_matches(home_team, played_on);
CREATE INDEX IF NOT EXISTS idx_processed_away ON processed_matches(away_team, played_on);
CREATE INDEX IF NOT EXISTS idx_prediction_log_match ON prediction_log(match_id);
"#;
