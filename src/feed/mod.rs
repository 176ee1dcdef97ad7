pub mod nhl;

pub use nhl::NhlScoreFeed;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{Engine, TrainOutcome};
use crate::models::MatchResult;

/// Trait that every completed-result feed must implement.
#[async_trait]
pub trait ResultFeed: Send + Sync {
    /// Final results of matches played on `date`.  Matches still in progress
    /// are left out.
    async fn final_results(&self, date: NaiveDate) -> Result<Vec<MatchResult>>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

/// Poll every feed for today's and yesterday's finals and train on each one
/// the ledger has not seen.  The engine makes repeats no-ops, so overlapping
/// polls and feeds are harmless.
pub fn start_result_monitor(
    engine: Arc<Engine>,
    feeds: Vec<Arc<dyn ResultFeed>>,
    poll_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let feed_names: Vec<&str> = feeds.iter().map(|f| f.name()).collect();
        info!(
            "Result monitor started ({} feeds: {:?}, interval={:?})",
            feeds.len(),
            feed_names,
            poll_interval
        );

        let feed_timeout = poll_interval.min(Duration::from_secs(15));
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let today = Utc::now().date_naive();
            let dates = [today - ChronoDuration::days(1), today];

            let fetches = feeds.iter().flat_map(|feed| {
                dates.iter().map(move |&date| {
                    let feed = Arc::clone(feed);
                    async move {
                        let out = match tokio::time::timeout(feed_timeout, feed.final_results(date)).await {
                            Ok(result) => result,
                            Err(_) => Err(anyhow::anyhow!("timed out after {:?}", feed_timeout)),
                        };
                        (feed.name().to_string(), date, out)
                    }
                })
            });
            let results = futures_util::future::join_all(fetches).await;

            let mut finals: BTreeMap<String, MatchResult> = BTreeMap::new();
            for (feed_name, date, out) in results {
                match out {
                    Ok(list) => {
                        debug!("Feed '{}' returned {} finals for {}", feed_name, list.len(), date);
                        for r in list {
                            finals.entry(r.match_id.clone()).or_insert(r);
                        }
                    }
                    Err(e) => warn!("Feed '{}' failed for {}: {}", feed_name, date, e),
                }
            }

            let mut applied = 0usize;
            // Oldest first so rating updates follow the order games were played.
            let mut ordered: Vec<MatchResult> = finals.into_values().collect();
            ordered.sort_by(|a, b| a.played_on.cmp(&b.played_on).then_with(|| a.match_id.cmp(&b.match_id)));
            for result in ordered {
                match engine.train(&result).await {
                    Ok(TrainOutcome::Applied { .. }) => applied += 1,
                    Ok(TrainOutcome::AlreadyProcessed) => {}
                    Err(e) => warn!("Skipping result {}: {}", result.match_id, e),
                }
            }
            if applied > 0 {
                info!("Result monitor applied {} new results", applied);
            }
        }
    })
}
