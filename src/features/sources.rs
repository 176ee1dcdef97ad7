use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use super::standings::{StandingsProvider, TeamSeasonStanding};
use super::{FallbackPolicy, FeatureGroup, Side};

/// What a signal source is asked for: one team's slice of a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalQuery {
    pub team: String,
    pub opponent: String,
    pub side: Side,
    pub as_of: NaiveDate,
}

/// Trait that every auxiliary feature source must implement.
///
/// `Ok(None)` means "explicitly unavailable" (e.g. no data for this team);
/// errors are transport or parse failures.  Both degrade the slice to
/// defaults.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// The feature group this source populates.
    fn group(&self) -> FeatureGroup;

    /// Human-readable name for logging and health reporting.
    fn name(&self) -> &str;

    /// Named numeric signals for one team, keyed by `Field::key()`.
    async fn fetch(&self, query: &SignalQuery) -> Result<Option<BTreeMap<String, f64>>>;
}

// ── Standings adapter ─────────────────────────────────────────────────────────

/// Exposes a `StandingsProvider` as the standings feature group.
pub struct StandingsSource {
    provider: Arc<dyn StandingsProvider>,
    policy: FallbackPolicy,
}

impl StandingsSource {
    pub fn new(provider: Arc<dyn StandingsProvider>, policy: FallbackPolicy) -> Self {
        StandingsSource { provider, policy }
    }
}

#[async_trait]
impl SignalSource for StandingsSource {
    fn group(&self) -> FeatureGroup {
        FeatureGroup::Standings
    }

    fn name(&self) -> &str {
        self.provider.name()
    }

    async fn fetch(&self, query: &SignalQuery) -> Result<Option<BTreeMap<String, f64>>> {
        let standing: Option<TeamSeasonStanding> =
            self.provider.standing(&query.team, query.as_of).await?;
        Ok(standing.map(|s| s.signals(&self.policy)))
    }
}

// ── Generic HTTP signal API ───────────────────────────────────────────────────

/// Auxiliary signals served as flat JSON objects by an HTTP service:
/// `GET {base}/{group}/{team}?date=YYYY-MM-DD&opponent=XXX&side=home`.
///
/// A 404 is treated as "no data for this team"; non-numeric members are
/// ignored.
pub struct HttpSignalSource {
    http: Client,
    base_url: String,
    group: FeatureGroup,
    name: String,
}

impl HttpSignalSource {
    pub fn new(base_url: &str, group: FeatureGroup, http: Client) -> Self {
        HttpSignalSource {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            group,
            name: format!("signals:{}", group.as_str()),
        }
    }
}

#[async_trait]
impl SignalSource for HttpSignalSource {
    fn group(&self) -> FeatureGroup {
        self.group
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, query: &SignalQuery) -> Result<Option<BTreeMap<String, f64>>> {
        let url = format!("{}/{}/{}", self.base_url, self.group.as_str(), query.team);
        debug!("Fetching {} signals from {}", self.group.as_str(), url);

        let resp = self
            .http
            .get(&url)
            .query(&[
                ("date", query.as_of.format("%Y-%m-%d").to_string()),
                ("opponent", query.opponent.clone()),
                ("side", query.side.as_str().to_string()),
            ])
            .send()
            .await
            .with_context(|| format!("{} request failed", self.name))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            anyhow::bail!("{} error: {}", self.name, resp.status());
        }

        let raw: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", self.name))?;
        Ok(parse_signal_object(&raw))
    }
}

/// Numbers (or numeric strings) from a flat JSON object.  Booleans map to
/// 0/1 so flags like `back_to_back` can be sent naturally.
pub(crate) fn parse_signal_object(raw: &serde_json::Value) -> Option<BTreeMap<String, f64>> {
    let obj = raw.get("signals").unwrap_or(raw).as_object()?;
    let signals: BTreeMap<String, f64> = obj
        .iter()
        .filter_map(|(k, v)| {
            let x = v
                .as_f64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
                .or_else(|| v.as_bool().map(|b| if b { 1.0 } else { 0.0 }))?;
            Some((k.clone(), x))
        })
        .collect();
    if signals.is_empty() {
        None
    } else {
        Some(signals)
    }
}
