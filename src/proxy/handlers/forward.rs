use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{info, warn};

use crate::proxy::endpoint::{Endpoint, SelectionRequest};
use crate::proxy::events::Topic;
use crate::proxy::handlers::errors::ErrorKind;
use crate::proxy::handlers::headers::build_upstream_headers;
use crate::proxy::handlers::retry::apply_retry_delay;
use crate::proxy::handlers::streaming::{
    compute_cost, extract_usage, relay_streaming_response, StreamContext,
};
use crate::proxy::state::AppState;
use crate::proxy::tracking::{RecordPatch, RequestStatus, UsageTracker};
use crate::proxy::upstream::UpstreamError;

// Per-request forwarding engine: select an endpoint, dial it, relay the
// response, and on retryable billing-safe failures fail over to the next
// candidate within the attempts cap. Once a single response byte has
// reached the client the request is pinned to that endpoint for good.

// Marks the record cancelled if the request future is dropped before a
// response was handed off (client disconnect, shutdown).
struct FinishGuard {
    tracker: Arc<UsageTracker>,
    request_id: u64,
    armed: bool,
}

impl FinishGuard {
    fn new(tracker: Arc<UsageTracker>, request_id: u64) -> Self {
        Self {
            tracker,
            request_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let tracker = self.tracker.clone();
        let request_id = self.request_id;
        tokio::spawn(async move {
            tracker
                .record_request_finish(request_id, RequestStatus::Cancelled, RecordPatch::default())
                .await;
        });
    }
}

pub async fn handle_forward(State(state): State<AppState>, request: Request) -> Response {
    if !*state.runtime.is_running.read().await {
        return proxy_error_response(503, "service_stopped", "proxy service is stopped", 0);
    }

    let method = request.method().clone();
    let uri = request.uri().clone();
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let incoming_headers = request.headers().clone();

    let max_body = state.config.app.read().await.server.max_body_size;
    let body = match axum::body::to_bytes(request.into_body(), max_body).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return proxy_error_response(400, "invalid_body", &format!("failed to read request body: {}", e), 0);
        }
    };

    let tracker = state.core.tracker.clone();
    let request_id = tracker
        .record_request_start(method.as_str(), uri.path())
        .await;
    let mut guard = FinishGuard::new(tracker.clone(), request_id);

    let (max_attempts, failover_enabled, failover_config, upstream_config, tracking_config) = {
        let config = state.config.app.read().await;
        (
            config.failover.max_attempts,
            config.failover.enabled,
            config.failover.clone(),
            config.upstream.clone(),
            config.tracking.clone(),
        )
    };

    let manager = state.core.endpoint_manager.clone();
    let classifier = state.core.classifier.clone();
    let wants_count_tokens = uri.path().ends_with("count_tokens");
    let mut exclude: HashSet<String> = HashSet::new();
    let mut attempt: u32 = 0;

    loop {
        // SELECTING
        let selection = SelectionRequest {
            exclude: exclude.clone(),
            wants_count_tokens,
        };
        let Some(endpoint) = manager.select_candidates(&selection).await.into_iter().next() else {
            warn!("[Forward] [req-{}] No healthy endpoint available", request_id);
            let response = finalize_error(
                &state,
                request_id,
                ErrorKind::NoHealthyEndpoints,
                "no healthy endpoints available",
                attempt,
            )
            .await;
            guard.disarm();
            return response;
        };

        attempt += 1;
        let endpoint_name = endpoint.config.name.clone();
        let group_name = endpoint.config.group_key().to_string();
        info!(
            "[Forward] [req-{}] Attempt {}/{} via endpoint {}",
            request_id, attempt, max_attempts.max(1), endpoint_name
        );
        tracker
            .record_request_update(
                request_id,
                RecordPatch {
                    status: Some(RequestStatus::Forwarding),
                    endpoint_name: Some(endpoint_name.clone()),
                    group_name: Some(group_name.clone()),
                    retry_count: Some(attempt.saturating_sub(1)),
                    ..Default::default()
                },
            )
            .await;

        // DIALING
        let upstream_headers = build_upstream_headers(&incoming_headers, &endpoint);
        let send_result = state
            .core
            .upstream
            .send(
                &endpoint,
                method.clone(),
                &path_and_query,
                upstream_headers,
                body.clone(),
            )
            .await;

        let (kind, message) = match send_result {
            Ok(response) => {
                let status = response.status().as_u16();
                if status < 400 {
                    // STREAMING / buffered relay; from here the request
                    // is pinned to this endpoint.
                    return relay_success(
                        &state,
                        response,
                        request_id,
                        &endpoint,
                        &group_name,
                        &upstream_config,
                        &tracking_config,
                        &mut guard,
                    )
                    .await;
                }

                let content_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .cloned();
                let body_text = response.text().await.unwrap_or_default();
                let kind = classifier.classify_response(status, &body_text);
                info!(
                    "[Forward] [req-{}] Upstream {} returned {} ({})",
                    request_id,
                    endpoint_name,
                    status,
                    kind.as_str()
                );

                if !(kind.is_retryable() && kind.billing_safe()) || attempt >= max_attempts {
                    // Pass the upstream error through verbatim.
                    tracker
                        .record_request_finish(
                            request_id,
                            kind.terminal_status(),
                            RecordPatch {
                                http_status: Some(status),
                                error: Some(truncate(&body_text, 512)),
                                ..Default::default()
                            },
                        )
                        .await;
                    emit_error_event(&state, request_id, kind, &endpoint_name, attempt, &body_text);
                    guard.disarm();
                    return passthrough_response(status, content_type, body_text);
                }
                (kind, format!("endpoint returned error: {}", status))
            }
            Err(UpstreamError::HeaderTimeout) => (
                ErrorKind::ResponseTimeout,
                "timed out waiting for response headers".to_string(),
            ),
            Err(UpstreamError::Transport(e)) => {
                (classifier.classify_transport(&e, false), e.to_string())
            }
        };

        warn!(
            "[Forward] [req-{}] Attempt {} on {} failed: {} ({})",
            request_id,
            attempt,
            endpoint_name,
            message,
            kind.as_str()
        );
        emit_error_event(&state, request_id, kind, &endpoint_name, attempt, &message);

        if !(kind.is_retryable() && kind.billing_safe()) || attempt >= max_attempts {
            let response = finalize_error(&state, request_id, kind, &message, attempt).await;
            guard.disarm();
            return response;
        }

        // Failover: cool the failed endpoint down and move its group out
        // of rotation before reselecting.
        exclude.insert(endpoint_name.clone());
        let reason = format!("{}: {}", kind.as_str(), message);
        if failover_enabled {
            match manager.trigger_request_failover(&endpoint_name, &reason).await {
                Ok(next) => info!(
                    "[Forward] [req-{}] Failover prepared: {} -> {}",
                    request_id, endpoint_name, next
                ),
                Err(e) => warn!("[Forward] [req-{}] Failover unavailable: {}", request_id, e),
            }
        } else if let Err(e) = manager.cooldown_endpoint(&endpoint_name, &reason).await {
            warn!("[Forward] [req-{}] Failed to set cooldown: {}", request_id, e);
        }

        // BACKOFF
        let mut delay = classifier
            .retry_delay(kind, attempt.saturating_sub(1), &failover_config)
            .unwrap_or(Duration::ZERO);
        if kind == ErrorKind::RateLimit {
            // Prefer an immediate switch over waiting out the limit when
            // another endpoint can take the request right now.
            let alternates = manager
                .select_candidates(&SelectionRequest {
                    exclude: exclude.clone(),
                    wants_count_tokens,
                })
                .await;
            if !alternates.is_empty() {
                delay = Duration::ZERO;
            }
        }
        apply_retry_delay(
            &tracker,
            request_id,
            &endpoint_name,
            &group_name,
            kind,
            delay,
            attempt,
            max_attempts,
        )
        .await;
    }
}

async fn relay_success(
    state: &AppState,
    response: reqwest::Response,
    request_id: u64,
    endpoint: &Arc<Endpoint>,
    group_name: &str,
    upstream_config: &crate::models::UpstreamConfig,
    tracking_config: &crate::models::TrackingConfig,
    guard: &mut FinishGuard,
) -> Response {
    let tracker = state.core.tracker.clone();
    let status = response.status().as_u16();
    let is_event_stream = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/event-stream"))
        .unwrap_or(false);

    if is_event_stream {
        tracker
            .record_request_update(
                request_id,
                RecordPatch {
                    status: Some(RequestStatus::Streaming),
                    http_status: Some(status),
                    ..Default::default()
                },
            )
            .await;

        // The pump task owns finalization from here, even if the client
        // drops the response future.
        guard.disarm();
        return relay_streaming_response(
            response,
            StreamContext {
                tracker,
                request_id,
                event_bus: state.core.event_bus.clone(),
                classifier: state.core.classifier.clone(),
                endpoint_name: endpoint.config.name.clone(),
                group_name: group_name.to_string(),
                http_status: status,
                cost_multiplier: endpoint.config.cost_multiplier,
                unit_cost_per_mtok: tracking_config.unit_cost_per_mtok,
                idle_read_timeout: Duration::from_secs(
                    upstream_config.idle_read_timeout_secs.max(1),
                ),
            },
        );
    }

    // Buffered relay for non-streaming responses.
    let response_headers = response.headers().clone();
    match response.bytes().await {
        Ok(bytes) => {
            let usage = extract_usage(&String::from_utf8_lossy(&bytes));
            let cost = usage.and_then(|(input, output)| {
                compute_cost(
                    input,
                    output,
                    tracking_config.unit_cost_per_mtok,
                    endpoint.config.cost_multiplier,
                )
            });
            tracker
                .record_request_finish(
                    request_id,
                    RequestStatus::Completed,
                    RecordPatch {
                        http_status: Some(status),
                        input_tokens: usage.map(|(input, _)| input),
                        output_tokens: usage.map(|(_, output)| output),
                        cost,
                        ..Default::default()
                    },
                )
                .await;
            state.core.event_bus.emit(
                Topic::UsageUpdate,
                "request_completed",
                json!({
                    "request_id": request_id,
                    "endpoint": endpoint.config.name,
                    "group": group_name,
                    "input_tokens": usage.map(|(input, _)| input),
                    "output_tokens": usage.map(|(_, output)| output),
                    "cost": cost,
                }),
            );
            guard.disarm();

            let mut builder = Response::builder().status(status);
            for (name, value) in response_headers.iter() {
                match name.as_str() {
                    "content-length" | "transfer-encoding" | "connection" => continue,
                    _ => {
                        builder = builder.header(name.as_str(), value.as_bytes());
                    }
                }
            }
            builder
                .body(Body::from(bytes))
                .unwrap_or_else(|_| Response::new(Body::empty()))
        }
        Err(e) => {
            // Headers arrived but the body died before any byte reached
            // the client; still final, the upstream may have billed.
            let kind = state.core.classifier.classify_transport(&e, true);
            warn!(
                "[Forward] [req-{}] Body read failed: {} ({})",
                request_id,
                e,
                kind.as_str()
            );
            tracker
                .record_request_finish(
                    request_id,
                    kind.terminal_status(),
                    RecordPatch {
                        http_status: Some(status),
                        error: Some(e.to_string()),
                        ..Default::default()
                    },
                )
                .await;
            guard.disarm();
            proxy_error_response(502, kind.as_str(), &e.to_string(), request_id)
        }
    }
}

async fn finalize_error(
    state: &AppState,
    request_id: u64,
    kind: ErrorKind,
    message: &str,
    attempt: u32,
) -> Response {
    let proxy_status: u16 = match kind {
        ErrorKind::ResponseTimeout => 504,
        ErrorKind::ClientCancel => 499,
        _ => 502,
    };
    state
        .core
        .tracker
        .record_request_finish(
            request_id,
            kind.terminal_status(),
            RecordPatch {
                http_status: Some(proxy_status),
                retry_count: Some(attempt.saturating_sub(1)),
                error: Some(message.to_string()),
                ..Default::default()
            },
        )
        .await;
    proxy_error_response(proxy_status, kind.as_str(), message, request_id)
}

fn emit_error_event(
    state: &AppState,
    request_id: u64,
    kind: ErrorKind,
    endpoint: &str,
    attempt: u32,
    raw_error: &str,
) {
    state.core.event_bus.emit(
        Topic::Error,
        kind.as_str(),
        json!({
            "request_id": request_id,
            "endpoint": endpoint,
            "attempt": attempt,
            "error": truncate(raw_error, 512),
        }),
    );
}

fn passthrough_response(
    status: u16,
    content_type: Option<axum::http::HeaderValue>,
    body: String,
) -> Response {
    let mut builder = Response::builder().status(status);
    if let Some(content_type) = content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

// Proxy-synthesized terminal error, structured like an upstream error
// body so clients can parse either uniformly.
fn proxy_error_response(status: u16, kind: &str, message: &str, request_id: u64) -> Response {
    let payload = json!({
        "error": {
            "type": kind,
            "message": message,
            "request_id": format!("req-{}", request_id),
        }
    });
    (
        axum::http::StatusCode::from_u16(status).unwrap_or(axum::http::StatusCode::BAD_GATEWAY),
        [(CONTENT_TYPE, "application/json")],
        payload.to_string(),
    )
        .into_response()
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let boundary = (0..=max).rev().find(|&i| text.is_char_boundary(i)).unwrap_or(0);
        format!("{}...", &text[..boundary])
    }
}
