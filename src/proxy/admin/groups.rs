use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::modules::persistence::endpoint_db;
use crate::proxy::admin::{internal_error, AdminError};
use crate::proxy::events::Topic;
use crate::proxy::state::AppState;

pub async fn admin_get_groups(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.core.endpoint_manager.get_groups())
}

#[derive(Deserialize, Default)]
pub struct ActivateGroupRequest {
    #[serde(default)]
    pub force: bool,
}

// Activation persists first: disable every stored endpoint, re-enable
// the members of the chosen group, then flip the in-memory state. Store
// failures are logged but do not abort the switch.
pub async fn admin_activate_group(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Option<Json<ActivateGroupRequest>>,
) -> Result<impl IntoResponse, AdminError> {
    let force = payload.map(|Json(p)| p.force).unwrap_or(false);
    let manager = state.core.endpoint_manager.clone();

    let members: Vec<String> = manager
        .snapshot()
        .iter()
        .filter(|ep| ep.config.group_key() == name)
        .map(|ep| ep.config.name.clone())
        .collect();

    let store_members = members.clone();
    let store_force = force;
    let store_result = tokio::task::spawn_blocking(move || {
        if !store_force {
            endpoint_db::disable_all()?;
        }
        for member in &store_members {
            endpoint_db::set_enabled(member, true)?;
        }
        Ok::<(), String>(())
    })
    .await;
    match store_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("[Admin] Failed to persist group activation: {}", e),
        Err(e) => warn!("[Admin] Group activation persistence task failed: {}", e),
    }

    manager
        .manual_activate_group(&name, force)
        .map_err(internal_error)?;

    state.core.event_bus.emit(
        Topic::Notification,
        "group_activated",
        json!({ "group": name, "force": force }),
    );
    info!("[Admin] Group '{}' activated (force: {})", name, force);
    Ok(StatusCode::OK)
}

#[derive(Deserialize, Default)]
pub struct PauseGroupRequest {
    pub duration_secs: Option<u64>,
}

pub async fn admin_pause_group(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Option<Json<PauseGroupRequest>>,
) -> Result<impl IntoResponse, AdminError> {
    let duration = payload
        .and_then(|Json(p)| p.duration_secs)
        .map(std::time::Duration::from_secs);
    state
        .core
        .endpoint_manager
        .manual_pause_group(&name, duration)
        .map_err(internal_error)?;
    Ok(StatusCode::OK)
}

pub async fn admin_resume_group(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, AdminError> {
    state
        .core
        .endpoint_manager
        .manual_resume_group(&name)
        .map_err(internal_error)?;
    Ok(StatusCode::OK)
}
