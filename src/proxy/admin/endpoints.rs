use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::models::EndpointConfig;
use crate::modules::persistence::endpoint_db;
use crate::modules::system::validation;
use crate::proxy::admin::{bad_request, internal_error, not_found, AdminError};
use crate::proxy::state::AppState;

// Endpoint CRUD. Every mutation persists to the config store before the
// in-memory registry changes; a store failure aborts the operation.

pub async fn admin_list_endpoints(State(state): State<AppState>) -> impl IntoResponse {
    let manager = &state.core.endpoint_manager;
    let endpoints: Vec<Value> = manager
        .snapshot()
        .iter()
        .map(|ep| {
            let status = ep.status();
            json!({
                "name": ep.config.name,
                "url": ep.config.url,
                "channel": ep.config.channel,
                "group": ep.config.group_key(),
                "priority": ep.config.priority,
                "failover_enabled": ep.config.participates_in_failover(),
                "cooldown_secs": ep.config.cooldown_secs,
                "cost_multiplier": ep.config.cost_multiplier,
                "supports_count_tokens": ep.config.supports_count_tokens,
                "token_count": ep.config.token_count(),
                "api_key_count": ep.config.api_key_count(),
                "group_active": manager.groups().is_group_active(ep.config.group_key()),
                "status": status,
            })
        })
        .collect();
    Json(endpoints)
}

pub async fn admin_add_endpoint(
    State(state): State<AppState>,
    Json(config): Json<EndpointConfig>,
) -> Result<impl IntoResponse, AdminError> {
    validation::validate_endpoints(std::slice::from_ref(&config))
        .map_err(|errors| bad_request(errors.join("; ")))?;

    let stored = config.clone();
    tokio::task::spawn_blocking(move || endpoint_db::create_endpoint(&stored, false))
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .map_err(internal_error)?;

    state
        .core
        .endpoint_manager
        .add_endpoint(config)
        .await
        .map_err(internal_error)?;
    Ok(StatusCode::CREATED)
}

pub async fn admin_update_endpoint(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(mut config): Json<EndpointConfig>,
) -> Result<impl IntoResponse, AdminError> {
    config.name = name.clone();
    validation::validate_endpoints(std::slice::from_ref(&config))
        .map_err(|errors| bad_request(errors.join("; ")))?;

    let stored = config.clone();
    let stored_name = name.clone();
    tokio::task::spawn_blocking(move || endpoint_db::update_endpoint(&stored_name, &stored))
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .map_err(not_found)?;

    state
        .core
        .endpoint_manager
        .update_endpoint_config(&name, config)
        .await
        .map_err(internal_error)?;
    Ok(StatusCode::OK)
}

pub async fn admin_remove_endpoint(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, AdminError> {
    let stored_name = name.clone();
    tokio::task::spawn_blocking(move || endpoint_db::delete_endpoint(&stored_name))
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .map_err(not_found)?;

    state
        .core
        .endpoint_manager
        .remove_endpoint(&name)
        .map_err(not_found)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct ToggleEndpointRequest {
    pub enabled: bool,
}

pub async fn admin_toggle_endpoint(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<ToggleEndpointRequest>,
) -> Result<impl IntoResponse, AdminError> {
    let stored_name = name.clone();
    let enabled = payload.enabled;
    tokio::task::spawn_blocking(move || endpoint_db::set_enabled(&stored_name, enabled))
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .map_err(not_found)?;

    let manager = &state.core.endpoint_manager;
    let endpoint = manager
        .by_name_any(&name)
        .ok_or_else(|| not_found(format!("endpoint '{}' not found", name)))?;
    let group = endpoint.config.group_key().to_string();

    if enabled {
        manager
            .manual_activate_group(&group, true)
            .map_err(internal_error)?;
    } else {
        let _ = manager.groups().deactivate_group(&group);
    }
    info!("[Admin] Endpoint '{}' toggled to enabled={}", name, enabled);
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
pub struct SwitchKeyRequest {
    pub index: usize,
}

pub async fn admin_switch_endpoint_token(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<SwitchKeyRequest>,
) -> Result<impl IntoResponse, AdminError> {
    state
        .core
        .endpoint_manager
        .switch_endpoint_token(&name, payload.index)
        .map_err(bad_request)?;
    Ok(StatusCode::OK)
}

pub async fn admin_switch_endpoint_api_key(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<SwitchKeyRequest>,
) -> Result<impl IntoResponse, AdminError> {
    state
        .core
        .endpoint_manager
        .switch_endpoint_api_key(&name, payload.index)
        .map_err(bad_request)?;
    Ok(StatusCode::OK)
}

pub async fn admin_get_endpoint_keys(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, AdminError> {
    state
        .core
        .endpoint_manager
        .get_endpoint_keys(&name)
        .map(Json)
        .ok_or_else(|| not_found(format!("endpoint '{}' not found", name)))
}

pub async fn admin_trigger_health_check(State(state): State<AppState>) -> impl IntoResponse {
    state.core.endpoint_manager.run_health_check_now().await;
    StatusCode::OK
}
