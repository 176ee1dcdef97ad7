use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::cache::PredictionSource;
use crate::engine::Engine;
use crate::ensemble::{MatchRequest, Prediction};
use crate::error::EngineError;
use crate::health::HealthStatus;
use crate::models::{team_code, MatchResult};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Build the Axum router for the prediction API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/models", get(models_handler))
        .route("/api/models/:name", get(model_handler))
        .route("/api/predict", get(predict_handler))
        .route("/api/train", post(train_handler))
        .route("/api/predictions", get(predictions_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

fn error_status(e: &EngineError) -> StatusCode {
    match e {
        EngineError::InvalidResult(_) => StatusCode::BAD_REQUEST,
        EngineError::UnknownModel(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(e: EngineError) -> (StatusCode, String) {
    (error_status(&e), e.to_string())
}

/// GET /api/health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.engine.health_snapshot().await;
    let code = match snapshot.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(snapshot))
}

/// GET /api/models
async fn models_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let names: Vec<String> = state.engine.model_names().into_iter().map(String::from).collect();
    Json(names)
}

/// GET /api/models/:name
async fn model_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state.engine.model_snapshot(&name).await.map(Json).map_err(reject)
}

#[derive(Debug, Deserialize)]
pub struct PredictQuery {
    pub home: String,
    pub away: String,
    pub match_id: Option<String>,
    pub date: Option<NaiveDate>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl PredictQuery {
    fn into_request(self, today: NaiveDate) -> Result<MatchRequest, (StatusCode, String)> {
        let home = team_code(&self.home);
        let away = team_code(&self.away);
        if home.is_empty() || away.is_empty() || home == away {
            return Err((
                StatusCode::BAD_REQUEST,
                "home and away must be two different team codes".to_string(),
            ));
        }
        let date = self
            .date
            .or_else(|| self.scheduled_at.map(|t| t.date_naive()))
            .unwrap_or(today);
        let match_id = self
            .match_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("{}-{}@{}", date.format("%Y%m%d"), away, home));
        Ok(MatchRequest {
            match_id,
            home_team: home,
            away_team: away,
            date,
            scheduled_at: self.scheduled_at,
        })
    }
}

#[derive(Debug, Serialize)]
struct PredictResponse {
    source: PredictionSource,
    #[serde(flatten)]
    prediction: Prediction,
}

/// GET /api/predict?home=BOS&away=TOR&date=2025-01-15
async fn predict_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PredictQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let request = query.into_request(Utc::now().date_naive())?;
    let (prediction, source) = state.engine.predict_with_source(&request).await;
    Ok(Json(PredictResponse { source, prediction }))
}

/// POST /api/train
async fn train_handler(
    State(state): State<Arc<AppState>>,
    Json(result): Json<MatchResult>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state.engine.train(&result).await.map(Json).map_err(reject)
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

/// GET /api/predictions?limit=50
async fn predictions_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    state.engine.recent_predictions(limit).map(Json).map_err(reject)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(home: &str, away: &str) -> PredictQuery {
        PredictQuery {
            home: home.into(),
            away: away.into(),
            match_id: None,
            date: None,
            scheduled_at: None,
        }
    }

    #[test]
    fn test_predict_query_defaults() {
        let today = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        let req = query(" bos", "tor ").into_request(today).unwrap();
        assert_eq!(req.home_team, "BOS");
        assert_eq!(req.away_team, "TOR");
        assert_eq!(req.date, today);
        assert_eq!(req.match_id, "20250115-TOR@BOS");
    }

    #[test]
    fn test_scheduled_start_sets_date() {
        let today = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        let mut q = query("BOS", "TOR");
        q.scheduled_at = Some("2025-02-01T00:30:00Z".parse().unwrap());
        q.match_id = Some("2024020777".into());
        let req = q.into_request(today).unwrap();
        assert_eq!(req.date, NaiveDate::from_ymd_opt(2025, 2, 1).unwrap());
        assert_eq!(req.match_id, "2024020777");
    }

    #[test]
    fn test_same_team_is_rejected() {
        let today = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        let err = query("BOS", "bos").into_request(today).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(error_status(&EngineError::UnknownModel("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(error_status(&EngineError::InvalidResult("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(error_status(&EngineError::LedgerPoisoned), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
