use std::collections::HashSet;

use crate::models::{AppConfig, EndpointConfig};

// Boot-time validation. Collects every problem instead of bailing on the
// first so operators can fix a config file in one pass.
pub fn validate_app_config(config: &AppConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.server.port == 0 {
        errors.push("server.port must be non-zero".to_string());
    }
    if config.failover.backoff_factor < 1.0 {
        errors.push("failover.backoff_factor must be >= 1.0".to_string());
    }
    if config.health_check.max_parallel == 0 {
        errors.push("health_check.max_parallel must be >= 1".to_string());
    }
    if config.tracking.hot_pool_size == 0 {
        errors.push("tracking.hot_pool_size must be >= 1".to_string());
    }
    for pattern in &config.rate_limit_rules.patterns {
        if let Err(e) = regex::Regex::new(pattern) {
            errors.push(format!("rate_limit_rules.patterns: invalid regex '{}': {}", pattern, e));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub fn validate_endpoints(endpoints: &[EndpointConfig]) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for ep in endpoints {
        if ep.name.trim().is_empty() {
            errors.push("endpoint name must not be empty".to_string());
            continue;
        }
        if !seen.insert(ep.name.clone()) {
            errors.push(format!("duplicate endpoint name '{}'", ep.name));
        }
        if let Err(e) = url::Url::parse(&ep.url) {
            errors.push(format!("endpoint '{}' has invalid url '{}': {}", ep.name, ep.url, e));
        }
        if ep.priority < 1 {
            errors.push(format!("endpoint '{}' priority must be >= 1", ep.name));
        }
        if ep.cost_multiplier < 0.0 {
            errors.push(format!("endpoint '{}' cost_multiplier must not be negative", ep.name));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn endpoint(name: &str, url: &str) -> EndpointConfig {
        EndpointConfig {
            name: name.to_string(),
            url: url.to_string(),
            channel: String::new(),
            group: String::new(),
            priority: 1,
            tokens: Vec::new(),
            api_keys: Vec::new(),
            token: String::new(),
            api_key: String::new(),
            failover_enabled: None,
            cooldown_secs: None,
            cost_multiplier: 1.0,
            supports_count_tokens: false,
            headers: HashMap::new(),
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(validate_app_config(&AppConfig::default()).is_ok());
    }

    #[test]
    fn duplicate_names_and_bad_urls_are_both_reported() {
        let endpoints = vec![
            endpoint("a", "https://one.example.com"),
            endpoint("a", "not a url"),
        ];
        let errors = validate_endpoints(&endpoints).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("duplicate"));
        assert!(errors[1].contains("invalid url"));
    }

    #[test]
    fn zero_priority_is_rejected() {
        let mut ep = endpoint("a", "https://one.example.com");
        ep.priority = 0;
        let errors = validate_endpoints(&[ep]).unwrap_err();
        assert!(errors[0].contains("priority"));
    }

    #[test]
    fn invalid_rate_limit_regex_is_reported() {
        let mut config = AppConfig::default();
        config.rate_limit_rules.patterns.push("(unclosed".to_string());
        let errors = validate_app_config(&config).unwrap_err();
        assert!(errors[0].contains("invalid regex"));
    }
}
