use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::{info, warn};

use crate::proxy::events::{EventBus, Topic};
use crate::proxy::handlers::errors::ErrorClassifier;
use crate::proxy::tracking::{RecordPatch, RequestStatus, UsageTracker};

// Streaming relay. Upstream bytes flow to the client chunk by chunk
// through a bounded channel; the pump task owns tracker finalization.
// Once the first byte has been relayed no other endpoint may be tried,
// so every error past this point is final for the request.

// Rolling tail kept for usage extraction; SSE usage frames arrive at the
// end of the stream.
const TAIL_WINDOW_BYTES: usize = 16 * 1024;

static INPUT_TOKENS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""input_tokens"\s*:\s*(\d+)"#).expect("input tokens regex"));
static OUTPUT_TOKENS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""output_tokens"\s*:\s*(\d+)"#).expect("output tokens regex"));

pub struct StreamContext {
    pub tracker: Arc<UsageTracker>,
    pub request_id: u64,
    pub event_bus: EventBus,
    pub classifier: Arc<ErrorClassifier>,
    pub endpoint_name: String,
    pub group_name: String,
    pub http_status: u16,
    pub cost_multiplier: f64,
    pub unit_cost_per_mtok: Option<f64>,
    pub idle_read_timeout: Duration,
}

// Builds the client response for a streaming upstream reply and spawns
// the pump that relays the body. Headers are passed through verbatim
// minus framing headers the relay re-derives.
pub fn relay_streaming_response(upstream: reqwest::Response, ctx: StreamContext) -> Response {
    let status = upstream.status();
    let mut builder = Response::builder().status(status.as_u16());
    for (name, value) in upstream.headers() {
        match name.as_str() {
            "content-length" | "transfer-encoding" | "connection" => continue,
            _ => {
                builder = builder.header(name.as_str(), value.as_bytes());
            }
        }
    }

    let (tx, rx) = futures::channel::mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    tokio::spawn(pump_upstream(upstream, tx, ctx));

    builder
        .body(Body::from_stream(rx))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

async fn pump_upstream(
    upstream: reqwest::Response,
    mut tx: futures::channel::mpsc::Sender<Result<Bytes, std::io::Error>>,
    ctx: StreamContext,
) {
    let mut stream = upstream.bytes_stream();
    let mut relayed_bytes: u64 = 0;
    let mut tail = String::new();

    loop {
        match tokio::time::timeout(ctx.idle_read_timeout, stream.next()).await {
            Ok(Some(Ok(chunk))) => {
                relayed_bytes += chunk.len() as u64;
                push_tail(&mut tail, &chunk);
                if tx.send(Ok(chunk)).await.is_err() {
                    // Client hung up; dropping `stream` closes the
                    // upstream connection.
                    info!(
                        "[Stream] [req-{}] Client disconnected after {} byte(s)",
                        ctx.request_id, relayed_bytes
                    );
                    ctx.tracker
                        .record_request_finish(
                            ctx.request_id,
                            RequestStatus::Cancelled,
                            RecordPatch::default(),
                        )
                        .await;
                    return;
                }
            }
            Ok(Some(Err(e))) => {
                let kind = ctx.classifier.classify_transport(&e, true);
                warn!(
                    "[Stream] [req-{}] Upstream stream error after {} byte(s): {} ({})",
                    ctx.request_id,
                    relayed_bytes,
                    e,
                    kind.as_str()
                );
                // A partial payload that still carried usage data is worth
                // distinguishing from a plain stream failure.
                let usage = extract_usage(&tail);
                let terminal = if usage.is_some() {
                    RequestStatus::PartialRecovery
                } else {
                    kind.terminal_status()
                };
                finalize(&ctx, terminal, usage, Some(e.to_string())).await;
                let _ = tx
                    .send(Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
                    .await;
                return;
            }
            Ok(None) => {
                let usage = extract_usage(&tail);
                finalize(&ctx, RequestStatus::Completed, usage, None).await;
                return;
            }
            Err(_) => {
                warn!(
                    "[Stream] [req-{}] Idle read timeout after {} byte(s)",
                    ctx.request_id, relayed_bytes
                );
                finalize(
                    &ctx,
                    RequestStatus::Timeout,
                    extract_usage(&tail),
                    Some("idle read timeout".to_string()),
                )
                .await;
                let _ = tx
                    .send(Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "idle read timeout",
                    )))
                    .await;
                return;
            }
        }
    }
}

async fn finalize(
    ctx: &StreamContext,
    terminal: RequestStatus,
    usage: Option<(u32, u32)>,
    error: Option<String>,
) {
    let cost = usage.and_then(|(input, output)| {
        compute_cost(input, output, ctx.unit_cost_per_mtok, ctx.cost_multiplier)
    });
    ctx.tracker
        .record_request_finish(
            ctx.request_id,
            terminal,
            RecordPatch {
                http_status: Some(ctx.http_status),
                input_tokens: usage.map(|(input, _)| input),
                output_tokens: usage.map(|(_, output)| output),
                cost,
                error,
                ..Default::default()
            },
        )
        .await;

    if terminal == RequestStatus::Completed {
        ctx.event_bus.emit(
            Topic::UsageUpdate,
            "request_completed",
            json!({
                "request_id": ctx.request_id,
                "endpoint": ctx.endpoint_name,
                "group": ctx.group_name,
                "input_tokens": usage.map(|(input, _)| input),
                "output_tokens": usage.map(|(_, output)| output),
                "cost": cost,
            }),
        );
    }
}

fn push_tail(tail: &mut String, chunk: &Bytes) {
    tail.push_str(&String::from_utf8_lossy(chunk));
    if tail.len() > TAIL_WINDOW_BYTES {
        let cut = tail.len() - TAIL_WINDOW_BYTES;
        // Cut on a char boundary.
        let boundary = (cut..tail.len())
            .find(|&i| tail.is_char_boundary(i))
            .unwrap_or(0);
        tail.drain(..boundary);
    }
}

// Pulls token counters out of a response payload (JSON body or SSE
// tail). Later occurrences win: SSE deltas report cumulative usage.
pub fn extract_usage(text: &str) -> Option<(u32, u32)> {
    let input = INPUT_TOKENS_RE
        .captures_iter(text)
        .last()
        .and_then(|caps| caps[1].parse::<u32>().ok());
    let output = OUTPUT_TOKENS_RE
        .captures_iter(text)
        .last()
        .and_then(|caps| caps[1].parse::<u32>().ok());

    match (input, output) {
        (None, None) => None,
        (input, output) => Some((input.unwrap_or(0), output.unwrap_or(0))),
    }
}

pub fn compute_cost(
    input_tokens: u32,
    output_tokens: u32,
    unit_cost_per_mtok: Option<f64>,
    cost_multiplier: f64,
) -> Option<f64> {
    let unit = unit_cost_per_mtok?;
    let tokens = (input_tokens as f64) + (output_tokens as f64);
    Some(tokens / 1_000_000.0 * unit * cost_multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_extraction_takes_the_last_occurrence() {
        let sse = concat!(
            "event: message_start\n",
            "data: {\"message\":{\"usage\":{\"input_tokens\":12,\"output_tokens\":1}}}\n\n",
            "event: message_delta\n",
            "data: {\"usage\":{\"output_tokens\":256}}\n\n",
        );
        assert_eq!(extract_usage(sse), Some((12, 256)));
    }

    #[test]
    fn usage_extraction_handles_missing_fields() {
        assert_eq!(extract_usage("no usage here"), None);
        assert_eq!(
            extract_usage(r#"{"usage":{"output_tokens":7}}"#),
            Some((0, 7))
        );
    }

    #[test]
    fn cost_requires_a_unit_price() {
        assert_eq!(compute_cost(100, 100, None, 1.0), None);
        let cost = compute_cost(500_000, 500_000, Some(3.0), 2.0).expect("cost");
        assert!((cost - 6.0).abs() < f64::EPSILON);
    }

    #[test]
    fn tail_window_keeps_the_end_of_the_stream() {
        let mut tail = String::new();
        push_tail(&mut tail, &Bytes::from(vec![b'a'; TAIL_WINDOW_BYTES]));
        push_tail(
            &mut tail,
            &Bytes::from_static(b"{\"usage\":{\"input_tokens\":3,\"output_tokens\":9}}"),
        );
        assert!(tail.len() <= TAIL_WINDOW_BYTES + 64);
        assert_eq!(extract_usage(&tail), Some((3, 9)));
    }
}
