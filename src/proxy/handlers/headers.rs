use axum::http::HeaderMap;
use reqwest::header::{HeaderName, HeaderValue};
use tracing::debug;

use crate::proxy::endpoint::Endpoint;

// Outbound header policy. The client's credentials never reach the
// upstream: `authorization` and `x-api-key` are stripped and replaced by
// the endpoint's active credential, then the endpoint's configured extra
// headers are injected.

const STRIPPED_HEADERS: [&str; 10] = [
    "authorization",
    "x-api-key",
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "proxy-authorization",
    "te",
    "transfer-encoding",
    "upgrade",
];

pub fn build_upstream_headers(incoming: &HeaderMap, endpoint: &Endpoint) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();

    for (name, value) in incoming.iter() {
        if STRIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(header_name), Ok(header_value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(header_name, header_value);
        }
    }

    endpoint.active_credential().apply(&mut headers);

    for (name, value) in &endpoint.config.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(header_name), Ok(header_value)) => {
                headers.insert(header_name, header_value);
            }
            _ => debug!("[Headers] Skipping invalid extra header '{}'", name),
        }
    }

    headers
}
