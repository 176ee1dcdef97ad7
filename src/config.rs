use clap::Parser;
use std::time::Duration;

use crate::engine::EngineSettings;
use crate::features::FallbackPolicy;

/// Ensemble match-outcome prediction service
#[derive(Parser, Debug, Clone)]
#[command(name = "matchcast", version, about)]
pub struct Config {
    /// HTTP API listen address
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// SQLite ledger path (processed matches and prediction log)
    #[arg(long, env = "DATABASE_PATH", default_value = "matchcast.db")]
    pub database_path: String,

    /// Directory holding one JSON snapshot per model
    #[arg(long, env = "SNAPSHOT_DIR", default_value = "snapshots")]
    pub snapshot_dir: String,

    /// NHL web API base URL (standings and final scores)
    #[arg(long, env = "NHL_API_URL", default_value = "https://api-web.nhle.com/v1")]
    pub nhl_api_url: String,

    /// Base URL of an auxiliary signals service (goalie form, odds, travel,
    /// player impact).  Those groups fall back to defaults when unset.
    #[arg(long, env = "SIGNALS_API_URL")]
    pub signals_api_url: Option<String>,

    /// HTTP client timeout in seconds
    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value = "10")]
    pub http_timeout_secs: u64,

    /// Per-source budget for one feature slice, in milliseconds
    #[arg(long, env = "SOURCE_TIMEOUT_MS", default_value = "2000")]
    pub source_timeout_ms: u64,

    /// Budget for the whole live prediction path, in milliseconds
    #[arg(long, env = "PREDICT_DEADLINE_MS", default_value = "5000")]
    pub predict_deadline_ms: u64,

    /// Lifetime of a cached prediction without a scheduled start, in seconds (at most a year)
    #[arg(
        long,
        env = "CACHE_TTL_SECS",
        default_value = "21600",
        value_parser = clap::value_parser!(u64).range(1..=31_536_000)
    )]
    pub cache_ttl_secs: u64,

    /// Result feed polling interval in seconds (0 disables the monitor)
    #[arg(long, env = "RESULT_POLL_SECS", default_value = "300")]
    pub result_poll_secs: u64,

    /// Keep ensemble weights fixed instead of adapting them to Brier scores
    #[arg(long, env = "FIXED_WEIGHTS", default_value = "false")]
    pub fixed_weights: bool,

    /// League-average goals per team per game
    #[arg(long, env = "LEAGUE_AVG_GOALS", default_value = "2.8")]
    pub league_avg_goals: f64,

    /// Win percentage assumed for teams without data
    #[arg(long, env = "DEFAULT_WIN_PCT", default_value = "0.5")]
    pub default_win_pct: f64,

    /// Rating given to teams the Elo model has not seen
    #[arg(long, env = "ELO_INITIAL_RATING", default_value = "1500")]
    pub elo_initial_rating: f64,

    /// Base Elo K-factor
    #[arg(long, env = "ELO_K_FACTOR", default_value = "32")]
    pub elo_k_factor: f64,

    /// Probability mass the win/lose models assign to regulation ties
    #[arg(long, env = "TIE_SHARE", default_value = "0.22")]
    pub tie_share: f64,

    /// Home/away probabilities closer than this are a tie (home wins it)
    #[arg(long, env = "TIE_EPSILON", default_value = "1e-9")]
    pub tie_epsilon: f64,

    /// Simulated games per Monte Carlo prediction
    #[arg(long, env = "SIMULATIONS", default_value = "2000")]
    pub simulations: usize,

    /// Seed for the neural network's initial weights
    #[arg(long, env = "NEURAL_SEED", default_value = "42")]
    pub neural_seed: u64,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.http_timeout_secs == 0 {
            anyhow::bail!("http_timeout_secs must be positive");
        }
        if self.source_timeout_ms == 0 || self.predict_deadline_ms == 0 {
            anyhow::bail!("source_timeout_ms and predict_deadline_ms must be positive");
        }
        if !(self.league_avg_goals > 0.0 && self.league_avg_goals.is_finite()) {
            anyhow::bail!("league_avg_goals must be a positive number");
        }
        if !(0.0..=1.0).contains(&self.default_win_pct) {
            anyhow::bail!("default_win_pct must be between 0.0 and 1.0");
        }
        if !(0.0..0.9).contains(&self.tie_share) {
            anyhow::bail!("tie_share must be in [0.0, 0.9)");
        }
        if !(self.elo_k_factor > 0.0) || !self.elo_initial_rating.is_finite() {
            anyhow::bail!("Elo parameters must be finite and k_factor positive");
        }
        if !(self.tie_epsilon >= 0.0) {
            anyhow::bail!("tie_epsilon must be non-negative");
        }
        if self.simulations == 0 {
            anyhow::bail!("simulations must be positive");
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }

    pub fn fallback_policy(&self) -> FallbackPolicy {
        FallbackPolicy {
            league_avg_goals: self.league_avg_goals,
            default_win_pct: self.default_win_pct,
            ..FallbackPolicy::default()
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let mut settings = EngineSettings {
            fallback: self.fallback_policy(),
            adaptive_weights: !self.fixed_weights,
            predict_deadline: Duration::from_millis(self.predict_deadline_ms),
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            ..EngineSettings::default()
        };
        settings.blend.tie_epsilon = self.tie_epsilon;

        let models = &mut settings.models;
        models.league_avg_goals = self.league_avg_goals;
        models.poisson.league_avg_goals = self.league_avg_goals;
        models.elo.initial_rating = self.elo_initial_rating;
        models.elo.k_factor = self.elo_k_factor;
        models.tie_share = self.tie_share;
        models.simulations = self.simulations;
        models.neural_seed = self.neural_seed;
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::parse_from(["matchcast"]);
        config.validate().unwrap();
        let settings = config.engine_settings();
        assert_eq!(settings.models.elo.initial_rating, 1500.0);
        assert_eq!(settings.fallback.league_avg_goals, 2.8);
        assert!(settings.adaptive_weights);
    }

    #[test]
    fn test_overrides_flow_into_settings() {
        let config = Config::parse_from([
            "matchcast",
            "--league-avg-goals",
            "3.1",
            "--fixed-weights",
            "--tie-epsilon",
            "0.001",
        ]);
        config.validate().unwrap();
        let settings = config.engine_settings();
        assert_eq!(settings.models.poisson.league_avg_goals, 3.1);
        assert_eq!(settings.fallback.league_avg_goals, 3.1);
        assert_eq!(settings.blend.tie_epsilon, 0.001);
        assert!(!settings.adaptive_weights);
    }

    #[test]
    fn test_cache_ttl_is_bounded() {
        let config = Config::try_parse_from(["matchcast", "--cache-ttl-secs", "31536000"]).unwrap();
        assert_eq!(config.engine_settings().cache_ttl, Duration::from_secs(31_536_000));
        assert!(Config::try_parse_from(["matchcast", "--cache-ttl-secs", "31536001"]).is_err());
        assert!(Config::try_parse_from(["matchcast", "--cache-ttl-secs", "0"]).is_err());
        assert!(Config::try_parse_from(["matchcast", "--cache-ttl-secs", "18446744073709551615"]).is_err());
    }

    #[test]
    fn test_invalid_tie_share_rejected() {
        let config = Config::parse_from(["matchcast", "--tie-share", "0.95"]);
        assert!(config.validate().is_err());
    }
}
