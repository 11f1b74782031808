use parking_lot::RwLock;
use serde::Serialize;

use crate::models::{AuthCredential, EndpointConfig};

// Dynamic per-endpoint state. Guarded by the endpoint's own lock, held
// only for short field reads and writes, never across I/O.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub healthy: bool,
    pub never_checked: bool,
    // Millisecond unix timestamps; cooldown_until == 0 means not cooling.
    pub last_check: i64,
    pub response_time_ms: u64,
    pub consecutive_fails: u32,
    pub cooldown_until: i64,
    pub cooldown_reason: String,
    pub active_token_index: usize,
    pub active_api_key_index: usize,
}

impl EndpointStatus {
    // Pessimistic initial state: unhealthy until the first probe reports.
    pub fn new() -> Self {
        Self {
            healthy: false,
            never_checked: true,
            last_check: chrono::Utc::now().timestamp_millis(),
            response_time_ms: 0,
            consecutive_fails: 0,
            cooldown_until: 0,
            cooldown_reason: String::new(),
            active_token_index: 0,
            active_api_key_index: 0,
        }
    }

    pub fn in_cooldown(&self, now_millis: i64) -> bool {
        self.cooldown_until != 0 && now_millis < self.cooldown_until
    }
}

impl Default for EndpointStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Endpoint {
    // Immutable for the life of this record; `update` swaps in a new
    // record with the status carried over.
    pub config: EndpointConfig,
    status: RwLock<EndpointStatus>,
}

impl Endpoint {
    pub fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            status: RwLock::new(EndpointStatus::new()),
        }
    }

    pub fn with_status(config: EndpointConfig, status: EndpointStatus) -> Self {
        Self {
            config,
            status: RwLock::new(status),
        }
    }

    pub fn status(&self) -> EndpointStatus {
        self.status.read().clone()
    }

    pub fn update_status<F: FnOnce(&mut EndpointStatus)>(&self, f: F) {
        let mut status = self.status.write();
        f(&mut status);
    }

    pub fn is_healthy(&self) -> bool {
        self.status.read().healthy
    }

    pub fn in_cooldown(&self, now_millis: i64) -> bool {
        self.status.read().in_cooldown(now_millis)
    }

    pub fn is_available(&self, now_millis: i64) -> bool {
        let status = self.status.read();
        status.healthy && !status.in_cooldown(now_millis)
    }

    // Resolves the upstream credential from the active indices.
    pub fn active_credential(&self) -> AuthCredential {
        let (token_index, api_key_index) = {
            let status = self.status.read();
            (status.active_token_index, status.active_api_key_index)
        };
        self.config.credential_at(token_index, api_key_index)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.config.name)
            .field("url", &self.config.url)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(name: &str) -> EndpointConfig {
        EndpointConfig {
            name: name.to_string(),
            url: "https://api.example.com".to_string(),
            channel: String::new(),
            group: String::new(),
            priority: 1,
            tokens: Vec::new(),
            api_keys: Vec::new(),
            token: "tok".to_string(),
            api_key: String::new(),
            failover_enabled: None,
            cooldown_secs: None,
            cost_multiplier: 1.0,
            supports_count_tokens: false,
            headers: HashMap::new(),
        }
    }

    #[test]
    fn new_endpoint_is_pessimistically_unhealthy() {
        let ep = Endpoint::new(config("a"));
        let status = ep.status();
        assert!(!status.healthy);
        assert!(status.never_checked);
        assert_eq!(status.consecutive_fails, 0);
    }

    #[test]
    fn cooldown_iff_cooldown_until_in_future() {
        let ep = Endpoint::new(config("a"));
        let now = chrono::Utc::now().timestamp_millis();
        assert!(!ep.in_cooldown(now));

        ep.update_status(|s| s.cooldown_until = now + 10_000);
        assert!(ep.in_cooldown(now));
        assert!(!ep.in_cooldown(now + 10_000));

        ep.update_status(|s| s.cooldown_until = 0);
        assert!(!ep.in_cooldown(now));
    }

    #[test]
    fn availability_requires_health_and_no_cooldown() {
        let ep = Endpoint::new(config("a"));
        let now = chrono::Utc::now().timestamp_millis();
        assert!(!ep.is_available(now));

        ep.update_status(|s| {
            s.healthy = true;
            s.never_checked = false;
        });
        assert!(ep.is_available(now));

        ep.update_status(|s| s.cooldown_until = now + 5_000);
        assert!(!ep.is_available(now));
    }

    #[test]
    fn active_credential_follows_switch_index() {
        let mut cfg = config("a");
        cfg.token = String::new();
        cfg.tokens = vec![
            crate::models::CredentialEntry {
                name: "first".to_string(),
                value: "tok-1".to_string(),
            },
            crate::models::CredentialEntry {
                name: "second".to_string(),
                value: "tok-2".to_string(),
            },
        ];
        let ep = Endpoint::new(cfg);
        assert_eq!(
            ep.active_credential(),
            AuthCredential::Token("tok-1".to_string())
        );

        ep.update_status(|s| s.active_token_index = 1);
        assert_eq!(
            ep.active_credential(),
            AuthCredential::Token("tok-2".to_string())
        );
    }
}
