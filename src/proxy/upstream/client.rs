use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::models::UpstreamConfig;
use crate::proxy::endpoint::Endpoint;

// Shared upstream HTTP client. The dial timeout lives on the client; the
// response-header timeout is applied per request. There is deliberately
// no total request timeout: streaming responses are bounded by the
// engine's idle-read timeout instead.

#[derive(Debug)]
pub enum UpstreamError {
    Transport(reqwest::Error),
    // No response headers within the configured window.
    HeaderTimeout,
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Transport(e) => write!(f, "{}", e),
            UpstreamError::HeaderTimeout => write!(f, "timed out waiting for response headers"),
        }
    }
}

pub struct UpstreamClient {
    client: Client,
    response_header_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs.max(1)))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            client,
            response_header_timeout: Duration::from_secs(
                config.response_header_timeout_secs.max(1),
            ),
        }
    }

    // Forwards the client request to `endpoint.url + path`, returning as
    // soon as response headers arrive. The body stays unread so callers
    // can relay it chunk by chunk.
    pub async fn send(
        &self,
        endpoint: &Endpoint,
        method: reqwest::Method,
        path_and_query: &str,
        headers: reqwest::header::HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = join_url(&endpoint.config.url, path_and_query);
        debug!("[Upstream] {} {}", method, url);

        let request = self
            .client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send();

        match tokio::time::timeout(self.response_header_timeout, request).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(UpstreamError::Transport(e)),
            Err(_) => Err(UpstreamError::HeaderTimeout),
        }
    }
}

fn join_url(base: &str, path_and_query: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    if path_and_query.starts_with('/') {
        format!("{}{}", trimmed, path_and_query)
    } else {
        format!("{}/{}", trimmed, path_and_query)
    }
}
