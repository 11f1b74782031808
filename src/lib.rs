pub mod error;
pub mod models;
pub mod modules;
pub mod proxy;
#[cfg(test)]
mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use error::{AppError, AppResult};
use modules::system::logger;
use proxy::events::Topic;

// Grace window for in-flight requests once shutdown begins.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn parse_env_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn apply_env_overrides(config: &mut crate::models::AppConfig) {
    if let Ok(port) = std::env::var("PORT") {
        let trimmed = port.trim();
        if !trimmed.is_empty() {
            match trimmed.parse::<u16>() {
                Ok(p) if p > 0 => {
                    config.server.port = p;
                    info!("Using proxy port from environment: {}", p);
                }
                _ => warn!("[W-PORT-INVALID] ignoring_invalid_port_value: {}", port),
            }
        }
    }

    if let Ok(allow_lan) = std::env::var("ALLOW_LAN_ACCESS") {
        if let Some(parsed) = parse_env_bool(&allow_lan) {
            config.server.allow_lan_access = parsed;
            info!(
                "Using LAN access setting from environment: {}",
                config.server.allow_lan_access
            );
        } else {
            warn!(
                "[W-LAN-ACCESS-INVALID] ignoring_invalid_lan_access_value: {}",
                allow_lan
            );
        }
    }
}

struct ServiceHandles {
    state: proxy::state::AppState,
    server_handle: tokio::task::JoinHandle<()>,
    flusher_handle: tokio::task::JoinHandle<()>,
    cancel_token: CancellationToken,
}

async fn start_service() -> AppResult<ServiceHandles> {
    let mut config = modules::system::config::load_app_config()
        .map_err(|e| AppError::Config(format!("failed_to_load_config: {}", e)))?;

    apply_env_overrides(&mut config);
    modules::system::validation::validate_app_config(&config).map_err(|errors| {
        AppError::Config(format!("configuration_validation_failed:\n{}", errors.join("\n")))
    })?;

    let stored = tokio::task::spawn_blocking(modules::persistence::endpoint_db::list_endpoints)
        .await
        .map_err(|e| AppError::Unknown(format!("endpoint_store_read_failed: {}", e)))?
        .map_err(|e| AppError::Endpoint(format!("endpoint_store_read_failed: {}", e)))?;

    let configs: Vec<models::EndpointConfig> = stored.iter().map(|s| s.config.clone()).collect();
    modules::system::validation::validate_endpoints(&configs).map_err(|errors| {
        AppError::Endpoint(format!("endpoint_validation_failed:\n{}", errors.join("\n")))
    })?;
    let enabled: Vec<String> = stored
        .iter()
        .filter(|s| s.enabled)
        .map(|s| s.config.name.clone())
        .collect();

    let cancel_token = CancellationToken::new();
    let event_bus = proxy::EventBus::new();
    let shared_config = Arc::new(tokio::sync::RwLock::new(config.clone()));

    let endpoint_manager = Arc::new(proxy::EndpointManager::new(
        shared_config.clone(),
        event_bus.clone(),
    ));
    endpoint_manager.sync_endpoints(configs, enabled);
    endpoint_manager.start_prober().await;

    // Persist the enabled flags when a request-level failover switches
    // groups, so a restart comes back on the surviving endpoint.
    endpoint_manager.set_on_failover(Arc::new(|failed: String, new: String| {
        if let Err(e) = modules::persistence::endpoint_db::set_enabled(&failed, false) {
            warn!("[Failover] Failed to persist disable of '{}': {}", failed, e);
        }
        if let Err(e) = modules::persistence::endpoint_db::set_enabled(&new, true) {
            warn!("[Failover] Failed to persist enable of '{}': {}", new, e);
        }
    }));

    let (tracker, flush_rx) = proxy::UsageTracker::new(config.tracking.clone());
    let flusher_handle = proxy::tracking::spawn_flusher(
        flush_rx,
        config.tracking.flush_batch_size,
        cancel_token.child_token(),
    );

    let classifier = Arc::new(proxy::handlers::errors::ErrorClassifier::new(
        &config.rate_limit_rules,
    ));
    let upstream = Arc::new(proxy::upstream::UpstreamClient::new(&config.upstream));

    let host = if config.server.allow_lan_access {
        warn!("[W-LAN-ACCESS-ENABLED] lan_access_enabled_bind_address_0_0_0_0");
        "0.0.0.0".to_string()
    } else {
        info!("LAN access is disabled (bind address will be 127.0.0.1)");
        "127.0.0.1".to_string()
    };
    let port = config.server.port;

    let state = proxy::state::AppState {
        core: Arc::new(proxy::state::CoreServices {
            endpoint_manager: endpoint_manager.clone(),
            tracker: tracker.clone(),
            upstream,
            event_bus: event_bus.clone(),
            classifier,
        }),
        config: Arc::new(proxy::state::ConfigState {
            app: shared_config,
        }),
        runtime: Arc::new(proxy::state::RuntimeState {
            is_running: Arc::new(tokio::sync::RwLock::new(true)),
            port,
            cancel_token: cancel_token.clone(),
        }),
    };

    let server_handle =
        proxy::server::start(host, port, state.clone(), cancel_token.child_token())
            .await
            .map_err(AppError::Unknown)?;

    event_bus.emit(
        Topic::SystemStatus,
        "started",
        serde_json::json!({ "port": port }),
    );
    info!("Proxy service is running on port {}", port);

    Ok(ServiceHandles {
        state,
        server_handle,
        flusher_handle,
        cancel_token,
    })
}

async fn stop_service(handles: ServiceHandles) {
    let ServiceHandles {
        state,
        server_handle,
        flusher_handle,
        cancel_token,
    } = handles;

    state.core.event_bus.emit(
        Topic::SystemStatus,
        "stopping",
        serde_json::json!({}),
    );
    {
        let mut running = state.runtime.is_running.write().await;
        *running = false;
    }

    // Stop accepting, then give in-flight requests the grace window.
    cancel_token.cancel();
    if tokio::time::timeout(SHUTDOWN_GRACE, server_handle).await.is_err() {
        warn!("Listener did not stop within {:?}", SHUTDOWN_GRACE);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    state
        .core
        .endpoint_manager
        .graceful_shutdown(SHUTDOWN_GRACE)
        .await;

    // The flusher drains the queue before exiting.
    if tokio::time::timeout(SHUTDOWN_GRACE, flusher_handle).await.is_err() {
        warn!("Tracker flusher did not drain within {:?}", SHUTDOWN_GRACE);
    }
    info!("Shutdown complete");
}

pub fn run() {
    logger::init_logger();

    if let Err(e) = modules::persistence::endpoint_db::init_db() {
        error!("[E-DB-ENDPOINT-INIT] failed_to_initialize_endpoint_store: {}", e);
    }
    if let Err(e) = modules::persistence::tracker_db::init_db() {
        error!("[E-DB-TRACKER-INIT] failed_to_initialize_tracker_store: {}", e);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("[E-RUNTIME-INIT] failed_to_create_tokio_runtime: {}", e);
            std::process::exit(1);
        }
    };
    runtime.block_on(async {
        let handles = match start_service().await {
            Ok(handles) => handles,
            Err(e) => {
                error!("[E-RUNTIME-STARTUP] {}", e);
                std::process::exit(1);
            }
        };

        info!("Proxy service is running. Press Ctrl+C to exit.");
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down proxy service");
        stop_service(handles).await;
    });
}
