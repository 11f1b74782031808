use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::models::HealthCheckConfig;
use crate::proxy::endpoint::registry::EndpointList;
use crate::proxy::endpoint::types::Endpoint;
use crate::proxy::events::{EventBus, Topic};

// Background health prober. One loop per manager; each pass snapshots
// the registry and probes endpoints concurrently with bounded
// parallelism. Cooldown is owned by the forwarding engine and is never
// touched here.

pub(crate) fn build_probe_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_default()
}

pub(crate) fn spawn_prober(
    endpoints: Arc<EndpointList>,
    client: reqwest::Client,
    event_bus: EventBus,
    config: HealthCheckConfig,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(config.interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            "[Health] Prober started (interval: {}s, parallelism: {})",
            config.interval_secs, config.max_parallel
        );
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("[Health] Prober received cancel signal");
                    break;
                }
                _ = interval.tick() => {
                    run_health_check(&endpoints, &client, &event_bus, &config).await;
                }
            }
        }
    })
}

pub(crate) async fn run_health_check(
    endpoints: &EndpointList,
    client: &reqwest::Client,
    event_bus: &EventBus,
    config: &HealthCheckConfig,
) {
    let snapshot = crate::proxy::endpoint::registry::snapshot(endpoints);
    if snapshot.is_empty() {
        return;
    }
    let timeout = Duration::from_secs(config.probe_timeout_secs.max(1));

    futures::stream::iter(snapshot)
        .for_each_concurrent(config.max_parallel.max(1), |ep| async move {
            probe_endpoint(client, &ep, timeout, event_bus).await;
        })
        .await;
}

// A probe is a lightweight HEAD against the endpoint base URL. Any HTTP
// response counts as reachable; only transport failures and timeouts
// mark the endpoint unhealthy.
pub(crate) async fn probe_endpoint(
    client: &reqwest::Client,
    endpoint: &Arc<Endpoint>,
    timeout: Duration,
    event_bus: &EventBus,
) {
    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, client.head(&endpoint.config.url).send()).await;
    let healthy = matches!(outcome, Ok(Ok(_)));
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let previous = endpoint.status();
    endpoint.update_status(|status| {
        status.last_check = chrono::Utc::now().timestamp_millis();
        status.never_checked = false;
        status.healthy = healthy;
        if healthy {
            status.response_time_ms = elapsed_ms;
            status.consecutive_fails = 0;
        } else {
            status.consecutive_fails += 1;
        }
    });

    let transitioned = previous.never_checked || previous.healthy != healthy;
    if transitioned {
        let current = endpoint.status();
        info!(
            "[Health] Endpoint {} is now {} ({}ms)",
            endpoint.config.name,
            if healthy { "healthy" } else { "unhealthy" },
            elapsed_ms
        );
        event_bus.emit(
            Topic::EndpointUpdate,
            "health_changed",
            json!({
                "endpoint": endpoint.config.name,
                "healthy": healthy,
                "response_time_ms": current.response_time_ms,
                "consecutive_fails": current.consecutive_fails,
            }),
        );
    } else {
        debug!(
            "[Health] Endpoint {} unchanged ({})",
            endpoint.config.name,
            if healthy { "healthy" } else { "unhealthy" }
        );
    }
}

// One-off probe used when an endpoint is added or its config updated.
pub(crate) fn probe_endpoint_soon(
    client: reqwest::Client,
    endpoint: Arc<Endpoint>,
    config: &HealthCheckConfig,
    event_bus: EventBus,
) {
    let timeout = Duration::from_secs(config.probe_timeout_secs.max(1));
    tokio::spawn(async move {
        probe_endpoint(&client, &endpoint, timeout, &event_bus).await;
    });
}
