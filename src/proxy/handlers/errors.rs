use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::models::{FailoverConfig, RateLimitRules};
use crate::proxy::tracking::RequestStatus;

// Error taxonomy for the forwarding engine. Each raw failure maps to
// exactly one kind; the kind decides whether the request may be retried
// and whether a retry is safe with respect to upstream billing.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unknown,
    Network,
    Eof,
    ConnectionTimeout,
    ResponseTimeout,
    Http,
    ServerError,
    Stream,
    Auth,
    RateLimit,
    Parsing,
    ClientCancel,
    NoHealthyEndpoints,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unknown => "unknown",
            ErrorKind::Network => "network",
            ErrorKind::Eof => "eof",
            ErrorKind::ConnectionTimeout => "connection_timeout",
            ErrorKind::ResponseTimeout => "response_timeout",
            ErrorKind::Http => "http",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Stream => "stream",
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Parsing => "parsing",
            ErrorKind::ClientCancel => "client_cancel",
            ErrorKind::NoHealthyEndpoints => "no_healthy_endpoints",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectionTimeout
                | ErrorKind::Network
                | ErrorKind::RateLimit
                | ErrorKind::ServerError
                | ErrorKind::Parsing
                | ErrorKind::NoHealthyEndpoints
        )
    }

    // Whether retrying on another endpoint cannot double-bill: the
    // upstream never started processing. EOF and post-connect timeouts
    // may already have been billed and must not be retried.
    pub fn billing_safe(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectionTimeout
                | ErrorKind::Network
                | ErrorKind::RateLimit
                | ErrorKind::ServerError
                | ErrorKind::Parsing
                | ErrorKind::NoHealthyEndpoints
        )
    }

    pub fn terminal_status(&self) -> RequestStatus {
        match self {
            ErrorKind::ClientCancel => RequestStatus::Cancelled,
            ErrorKind::ResponseTimeout => RequestStatus::Timeout,
            ErrorKind::ConnectionTimeout => RequestStatus::ConnectionTimeout,
            ErrorKind::Eof => RequestStatus::EofInterrupted,
            ErrorKind::Auth => RequestStatus::AuthError,
            ErrorKind::RateLimit => RequestStatus::RateLimited,
            ErrorKind::ServerError => RequestStatus::ServerError,
            ErrorKind::Stream => RequestStatus::StreamError,
            _ => RequestStatus::Error,
        }
    }
}

pub struct ErrorClassifier {
    rate_limit_patterns: Vec<Regex>,
    treat_bad_request_as_rate_limit: bool,
    rate_limit_retry: Duration,
}

impl ErrorClassifier {
    pub fn new(rules: &RateLimitRules) -> Self {
        let rate_limit_patterns = rules
            .patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("[Classifier] Skipping invalid rate-limit pattern '{}': {}", pattern, e);
                    None
                }
            })
            .collect();
        Self {
            rate_limit_patterns,
            treat_bad_request_as_rate_limit: rules.treat_bad_request_as_rate_limit,
            rate_limit_retry: Duration::from_secs(rules.retry_delay_secs.max(60)),
        }
    }

    fn matches_rate_limit(&self, text: &str) -> bool {
        self.rate_limit_patterns.iter().any(|re| re.is_match(text))
    }

    // Classifies a transport-level failure from the upstream client.
    // `streaming_started` marks errors observed after response headers,
    // where a broken stream means EOF/stream trouble rather than a
    // connection problem.
    pub fn classify_transport(&self, error: &reqwest::Error, streaming_started: bool) -> ErrorKind {
        let text = full_error_text(error);

        if is_eof_text(&text) {
            return ErrorKind::Eof;
        }
        if error.is_timeout() {
            return if error.is_connect() {
                ErrorKind::ConnectionTimeout
            } else {
                ErrorKind::ResponseTimeout
            };
        }
        if error.is_connect() {
            // Dial-phase timeouts sometimes surface without the timeout
            // flag; the message tells them apart from refusals.
            if text.contains("timed out") || text.contains("timeout") {
                return ErrorKind::ConnectionTimeout;
            }
            return ErrorKind::Network;
        }
        if is_network_text(&text) {
            return if streaming_started {
                ErrorKind::Eof
            } else {
                ErrorKind::Network
            };
        }
        if error.is_body() || error.is_decode() {
            return if streaming_started {
                ErrorKind::Stream
            } else {
                ErrorKind::Parsing
            };
        }

        debug!("[Classifier] Unclassified transport error: {}", text);
        ErrorKind::Unknown
    }

    // Classifies an HTTP error response (status already >= 400) before
    // any byte has been relayed to the client.
    pub fn classify_response(&self, status: u16, body: &str) -> ErrorKind {
        if status == 429 {
            return ErrorKind::RateLimit;
        }
        if status == 400 && self.treat_bad_request_as_rate_limit && self.matches_rate_limit(body) {
            return ErrorKind::RateLimit;
        }
        if (500..600).contains(&status) {
            return ErrorKind::ServerError;
        }
        if status == 401 || is_auth_text(body) {
            return ErrorKind::Auth;
        }
        ErrorKind::Http
    }

    // Suggested delay before the next attempt. None means the error is
    // final for this request.
    pub fn retry_delay(
        &self,
        kind: ErrorKind,
        attempt: u32,
        config: &FailoverConfig,
    ) -> Option<Duration> {
        match kind {
            ErrorKind::ConnectionTimeout
            | ErrorKind::Network
            | ErrorKind::ServerError
            | ErrorKind::Parsing => Some(backoff_delay(config, attempt)),
            ErrorKind::RateLimit => Some(self.rate_limit_retry),
            ErrorKind::NoHealthyEndpoints => Some(Duration::ZERO),
            _ => None,
        }
    }
}

// Exponential backoff: base * factor^attempt, clamped to the maximum.
pub fn backoff_delay(config: &FailoverConfig, attempt: u32) -> Duration {
    let factor = config.backoff_factor.max(1.0);
    let delay_ms = (config.base_delay_ms as f64) * factor.powi(attempt as i32);
    Duration::from_millis((delay_ms as u64).min(config.max_delay_ms))
}

fn full_error_text(error: &reqwest::Error) -> String {
    let mut text = error.to_string().to_lowercase();
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        text.push_str(" / ");
        text.push_str(&inner.to_string().to_lowercase());
        source = inner.source();
    }
    text
}

fn is_eof_text(text: &str) -> bool {
    text.contains("unexpected eof") || text.contains("eof") || text.contains("end of file")
}

fn is_network_text(text: &str) -> bool {
    const NETWORK_MARKERS: [&str; 7] = [
        "connection refused",
        "connection reset",
        "connection closed",
        "network is unreachable",
        "no route to host",
        "broken pipe",
        "dns error",
    ];
    NETWORK_MARKERS.iter().any(|marker| text.contains(marker))
}

fn is_auth_text(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("unauthorized")
        || lower.contains("invalid api key")
        || lower.contains("authentication_error")
}
