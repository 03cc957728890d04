use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde::Deserialize;
use tracing::info;

use keygate_common::ProxySettingsPatch;
use keygate_core::AppState;

const DEFAULT_LOG_LIMIT: usize = 100;

pub fn admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/settings", get(get_settings).put(put_settings))
        .route("/stats", get(get_stats))
        .route("/health", get(get_health))
        .route("/recent-logs", get(get_recent_logs))
        .route("/reset-stats", post(reset_stats))
        .with_state(state)
}

async fn get_settings(State(state): State<Arc<AppState>>) -> Response {
    Json(state.processor.settings()).into_response()
}

async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<ProxySettingsPatch>,
) -> Response {
    match state.processor.update_settings(patch) {
        Ok(settings) => {
            state.persist_settings().await;
            info!(event = "settings_applied", ?settings);
            Json(settings).into_response()
        }
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Response {
    Json(state.processor.stats().detailed()).into_response()
}

async fn get_health(State(state): State<Arc<AppState>>) -> Response {
    Json(state.processor.stats().health()).into_response()
}

#[derive(Debug, Deserialize)]
struct RecentLogsQuery {
    limit: Option<usize>,
}

async fn get_recent_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentLogsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    Json(state.recent_logs(limit)).into_response()
}

async fn reset_stats(State(state): State<Arc<AppState>>) -> Response {
    state.processor.stats().reset();
    info!(event = "stats_reset");
    StatusCode::NO_CONTENT.into_response()
}
