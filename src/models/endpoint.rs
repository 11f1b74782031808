use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// One named credential in an endpoint's token/api-key list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialEntry {
    #[serde(default)]
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub group: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub tokens: Vec<CredentialEntry>,
    #[serde(default)]
    pub api_keys: Vec<CredentialEntry>,
    // Single-credential fallbacks, used when the lists above are empty.
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub api_key: String,
    // None means true; false excludes this endpoint from failover candidates.
    #[serde(default)]
    pub failover_enabled: Option<bool>,
    // Per-endpoint cooldown override in seconds.
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
    #[serde(default = "default_cost_multiplier")]
    pub cost_multiplier: f64,
    #[serde(default)]
    pub supports_count_tokens: bool,
    // Extra request headers injected on every forwarded request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_priority() -> u32 {
    1
}

fn default_cost_multiplier() -> f64 {
    1.0
}

impl EndpointConfig {
    // Group key used by the group manager. Endpoints without an explicit
    // group each form their own single-endpoint group.
    pub fn group_key(&self) -> &str {
        if self.group.is_empty() {
            &self.name
        } else {
            &self.group
        }
    }

    pub fn participates_in_failover(&self) -> bool {
        self.failover_enabled.unwrap_or(true)
    }

    pub fn token_count(&self) -> usize {
        if !self.tokens.is_empty() {
            self.tokens.len()
        } else if !self.token.is_empty() {
            1
        } else {
            0
        }
    }

    pub fn api_key_count(&self) -> usize {
        if !self.api_keys.is_empty() {
            self.api_keys.len()
        } else if !self.api_key.is_empty() {
            1
        } else {
            0
        }
    }

    pub fn token_at(&self, index: usize) -> Option<&str> {
        if !self.tokens.is_empty() {
            self.tokens.get(index).map(|t| t.value.as_str())
        } else if index == 0 && !self.token.is_empty() {
            Some(self.token.as_str())
        } else {
            None
        }
    }

    pub fn api_key_at(&self, index: usize) -> Option<&str> {
        if !self.api_keys.is_empty() {
            self.api_keys.get(index).map(|k| k.value.as_str())
        } else if index == 0 && !self.api_key.is_empty() {
            Some(self.api_key.as_str())
        } else {
            None
        }
    }

    // Resolves the credential to send upstream given the active indices.
    // Tokens win over API keys when both are configured.
    pub fn credential_at(&self, token_index: usize, api_key_index: usize) -> AuthCredential {
        if let Some(token) = self.token_at(token_index) {
            return AuthCredential::Token(token.to_string());
        }
        if let Some(key) = self.api_key_at(api_key_index) {
            return AuthCredential::ApiKey(key.to_string());
        }
        AuthCredential::None
    }
}

// Tagged credential variant with one header-writing operation per arm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthCredential {
    Token(String),
    ApiKey(String),
    None,
}

impl AuthCredential {
    pub fn apply(&self, headers: &mut reqwest::header::HeaderMap) {
        use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION};
        match self {
            AuthCredential::Token(token) => {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                    headers.insert(AUTHORIZATION, value);
                }
            }
            AuthCredential::ApiKey(key) => {
                if let Ok(value) = HeaderValue::from_str(key) {
                    headers.insert(HeaderName::from_static("x-api-key"), value);
                }
            }
            AuthCredential::None => {}
        }
    }
}

// Masks a credential for UI listings: first 4 + "****" + last 4,
// or "****" alone when the value is too short to reveal anything.
pub fn mask_key(key: &str) -> String {
    if key.len() <= 8 {
        "****".to_string()
    } else {
        format!("{}****{}", &key[..4], &key[key.len() - 4..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(tokens: Vec<CredentialEntry>, token: &str, api_key: &str) -> EndpointConfig {
        EndpointConfig {
            name: "ep".to_string(),
            url: "https://api.example.com".to_string(),
            channel: String::new(),
            group: String::new(),
            priority: 1,
            tokens,
            api_keys: Vec::new(),
            token: token.to_string(),
            api_key: api_key.to_string(),
            failover_enabled: None,
            cooldown_secs: None,
            cost_multiplier: 1.0,
            supports_count_tokens: false,
            headers: HashMap::new(),
        }
    }

    #[test]
    fn mask_key_hides_short_values_entirely() {
        assert_eq!(mask_key("12345678"), "****");
        assert_eq!(mask_key(""), "****");
    }

    #[test]
    fn mask_key_keeps_head_and_tail_of_longer_values() {
        assert_eq!(mask_key("123456789"), "1234****6789");
        assert_eq!(mask_key("sk-abcdefghij"), "sk-a****ghij");
    }

    #[test]
    fn single_token_fallback_counts_as_one_credential() {
        let cfg = config_with(Vec::new(), "tok-value", "");
        assert_eq!(cfg.token_count(), 1);
        assert_eq!(cfg.token_at(0), Some("tok-value"));
        assert_eq!(cfg.token_at(1), None);
    }

    #[test]
    fn token_list_takes_precedence_over_fallback() {
        let cfg = config_with(
            vec![CredentialEntry {
                name: "primary".to_string(),
                value: "list-tok".to_string(),
            }],
            "fallback-tok",
            "",
        );
        assert_eq!(cfg.token_at(0), Some("list-tok"));
    }

    #[test]
    fn credential_prefers_token_over_api_key() {
        let cfg = config_with(Vec::new(), "tok", "key");
        assert_eq!(
            cfg.credential_at(0, 0),
            AuthCredential::Token("tok".to_string())
        );
    }

    #[test]
    fn credential_falls_back_to_api_key_then_none() {
        let cfg = config_with(Vec::new(), "", "key");
        assert_eq!(
            cfg.credential_at(0, 0),
            AuthCredential::ApiKey("key".to_string())
        );

        let bare = config_with(Vec::new(), "", "");
        assert_eq!(bare.credential_at(0, 0), AuthCredential::None);
    }

    #[test]
    fn empty_group_defaults_to_endpoint_name() {
        let cfg = config_with(Vec::new(), "", "");
        assert_eq!(cfg.group_key(), "ep");
    }

    #[test]
    fn apply_writes_bearer_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        AuthCredential::Token("abc".to_string()).apply(&mut headers);
        assert_eq!(
            headers.get(reqwest::header::AUTHORIZATION).unwrap(),
            "Bearer abc"
        );
    }
}
