use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::models::AppConfig;
use crate::modules::persistence::tracker_db;
use crate::modules::system::{config as system_config, log_bridge, validation};
use crate::proxy::admin::{bad_request, internal_error, AdminError};
use crate::proxy::events::Topic;
use crate::proxy::state::AppState;

#[derive(Deserialize, Default)]
pub struct RecentLogsQuery {
    pub limit: Option<usize>,
}

pub async fn admin_get_recent_logs(Query(params): Query<RecentLogsQuery>) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(200).min(5_000);
    Json(log_bridge::get_recent_logs(limit))
}

pub async fn admin_start_log_stream() -> impl IntoResponse {
    log_bridge::start_log_stream();
    StatusCode::OK
}

pub async fn admin_stop_log_stream() -> impl IntoResponse {
    log_bridge::stop_log_stream();
    StatusCode::OK
}

pub async fn admin_query_records(
    Query(filter): Query<tracker_db::RecordFilter>,
) -> Result<impl IntoResponse, AdminError> {
    let records = tokio::task::spawn_blocking(move || tracker_db::query(&filter))
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .map_err(internal_error)?;
    Ok(Json(records))
}

#[derive(Deserialize, Default)]
pub struct RecentRecordsQuery {
    pub limit: Option<usize>,
}

pub async fn admin_recent_records(
    State(state): State<AppState>,
    Query(params): Query<RecentRecordsQuery>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(100).min(1_000);
    Json(state.core.tracker.recent_records(limit).await)
}

pub async fn admin_get_stats(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.core.tracker.stats().await;
    let running = *state.runtime.is_running.read().await;
    Json(json!({
        "running": running,
        "port": state.runtime.port,
        "endpoint_count": state.core.endpoint_manager.count(),
        "in_flight": state.core.tracker.in_flight_count().await,
        "requests": stats,
    }))
}

pub async fn admin_get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.config.app.read().await.clone())
}

#[derive(Deserialize)]
pub struct SaveConfigRequest {
    pub config: AppConfig,
}

// Persists the new config, hot-swaps the shared state, and announces the
// reload. Strategy and failover changes apply to the next request.
pub async fn admin_save_config(
    State(state): State<AppState>,
    Json(payload): Json<SaveConfigRequest>,
) -> Result<impl IntoResponse, AdminError> {
    let new_config = payload.config;
    validation::validate_app_config(&new_config).map_err(|errors| bad_request(errors.join("; ")))?;

    let persisted = new_config.clone();
    tokio::task::spawn_blocking(move || system_config::save_app_config(&persisted))
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .map_err(internal_error)?;

    {
        let mut config = state.config.app.write().await;
        *config = new_config;
    }

    state
        .core
        .event_bus
        .emit(Topic::ConfigReloaded, "config_saved", json!({}));
    Ok(StatusCode::OK)
}
