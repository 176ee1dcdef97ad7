use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

mod api;
mod cache;
mod config;
mod db;
mod engine;
mod ensemble;
mod error;
mod features;
mod feed;
mod health;
mod models;
mod persistence;

use api::AppState;
use config::Config;
use db::Database;
use engine::{Engine, ModelRegistry};
use features::history::{MatchupHistorySource, RollingFormSource};
use features::sources::{HttpSignalSource, StandingsSource};
use features::standings::NhlStandingsClient;
use features::{FeatureExtractor, FeatureGroup};
use feed::{start_result_monitor, NhlScoreFeed, ResultFeed};
use persistence::SnapshotStore;

const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;
    let settings = config.engine_settings();

    // Open ledger
    let db = Database::open(&config.database_path)
        .with_context(|| format!("Failed to open ledger {}", config.database_path))?;
    info!("Ledger opened: {}", config.database_path);

    let store = SnapshotStore::open(&config.snapshot_dir)
        .with_context(|| format!("Failed to open snapshot dir {}", config.snapshot_dir))?;

    let http = Client::builder()
        .timeout(config.http_timeout())
        .build()
        .context("Failed to build HTTP client")?;

    // Feature sources: standings from the NHL API, form and matchups from the
    // ledger, the rest from the optional signals service.
    let standings = Arc::new(NhlStandingsClient::new(&config.nhl_api_url, http.clone()));
    let mut extractor = FeatureExtractor::new(settings.fallback.clone(), config.source_timeout())
        .with_source(Arc::new(StandingsSource::new(standings, settings.fallback.clone())))
        .with_source(Arc::new(RollingFormSource::new(db.clone())))
        .with_source(Arc::new(MatchupHistorySource::new(db.clone())));
    if let Some(url) = &config.signals_api_url {
        for group in [
            FeatureGroup::GoalieForm,
            FeatureGroup::MarketOdds,
            FeatureGroup::TravelRest,
            FeatureGroup::PlayerImpact,
        ] {
            extractor = extractor.with_source(Arc::new(HttpSignalSource::new(url, group, http.clone())));
        }
    }
    info!("Feature sources: {:?}", extractor.source_names());

    let registry = ModelRegistry::new(models::default_models(&settings.models))?;
    let engine = Arc::new(Engine::new(settings, registry, extractor, store, db).await);
    engine.restore_all().await;
    info!("Models ready: {:?}", engine.model_names());

    if config.result_poll_secs > 0 {
        let feeds: Vec<Arc<dyn ResultFeed>> =
            vec![Arc::new(NhlScoreFeed::new(&config.nhl_api_url, http.clone()))];
        start_result_monitor(
            Arc::clone(&engine),
            feeds,
            Duration::from_secs(config.result_poll_secs),
        );
    }

    // Background cache purge
    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CACHE_PURGE_INTERVAL);
            loop {
                interval.tick().await;
                let purged = engine.purge_cache().await;
                if purged > 0 {
                    debug!("Purged {} expired predictions", purged);
                }
            }
        });
    }

    let app = api::router(AppState { engine });
    let addr: SocketAddr = config.listen_addr.parse()?;
    info!("API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Run API server (blocks until shutdown)
    axum::serve(listener, app).await?;

    Ok(())
}
