use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::models::AppConfig;
use crate::proxy::endpoint::EndpointManager;
use crate::proxy::events::EventBus;
use crate::proxy::handlers::errors::ErrorClassifier;
use crate::proxy::tracking::UsageTracker;
use crate::proxy::upstream::UpstreamClient;

#[derive(Clone)]
pub struct CoreServices {
    pub endpoint_manager: Arc<EndpointManager>,
    pub tracker: Arc<UsageTracker>,
    pub upstream: Arc<UpstreamClient>,
    pub event_bus: EventBus,
    pub classifier: Arc<ErrorClassifier>,
}

#[derive(Clone)]
pub struct ConfigState {
    pub app: Arc<tokio::sync::RwLock<AppConfig>>,
}

#[derive(Clone)]
pub struct RuntimeState {
    pub is_running: Arc<tokio::sync::RwLock<bool>>,
    pub port: u16,
    pub cancel_token: CancellationToken,
}

// Axum application state
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<CoreServices>,
    pub config: Arc<ConfigState>,
    pub runtime: Arc<RuntimeState>,
}

impl axum::extract::FromRef<AppState> for Arc<CoreServices> {
    fn from_ref(state: &AppState) -> Self {
        state.core.clone()
    }
}

impl axum::extract::FromRef<AppState> for Arc<ConfigState> {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}

impl axum::extract::FromRef<AppState> for Arc<RuntimeState> {
    fn from_ref(state: &AppState) -> Self {
        state.runtime.clone()
    }
}
