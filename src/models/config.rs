use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub rate_limit_rules: RateLimitRules,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
}

// Dial, response-header, and idle-read timeouts are separate concerns:
// streaming responses get an idle-read timeout instead of a total one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_response_header_timeout_secs")]
    pub response_header_timeout_secs: u64,
    #[serde(default = "default_idle_read_timeout_secs")]
    pub idle_read_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    20
}

fn default_response_header_timeout_secs() -> u64 {
    300
}

fn default_idle_read_timeout_secs() -> u64 {
    120
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            response_header_timeout_secs: default_response_header_timeout_secs(),
            idle_read_timeout_secs: default_idle_read_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub allow_lan_access: bool,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_port() -> u16 {
    8087
}

fn default_max_body_size() -> usize {
    100 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            allow_lan_access: false,
            max_body_size: default_max_body_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Priority,
    Fastest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_strategy_kind")]
    pub kind: StrategyKind,
    // Real-time latency probing for the fastest strategy.
    #[serde(default)]
    pub fast_test_enabled: bool,
    #[serde(default = "default_fast_test_timeout_ms")]
    pub fast_test_timeout_ms: u64,
    #[serde(default = "default_fast_test_cache_ttl_secs")]
    pub fast_test_cache_ttl_secs: u64,
}

fn default_strategy_kind() -> StrategyKind {
    StrategyKind::Priority
}

fn default_fast_test_timeout_ms() -> u64 {
    3_000
}

fn default_fast_test_cache_ttl_secs() -> u64 {
    10
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: default_strategy_kind(),
            fast_test_enabled: false,
            fast_test_timeout_ms: default_fast_test_timeout_ms(),
            fast_test_cache_ttl_secs: default_fast_test_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cooldown_secs")]
    pub default_cooldown_secs: u64,
    // Cooldown assignments are clamped to this ceiling.
    #[serde(default = "default_max_cooldown_secs")]
    pub max_cooldown_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_cooldown_secs() -> u64 {
    600
}

fn default_max_cooldown_secs() -> u64 {
    3_600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_cooldown_secs: default_cooldown_secs(),
            max_cooldown_secs: default_max_cooldown_secs(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_check_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_max_parallel() -> usize {
    8
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_check_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            max_parallel: default_max_parallel(),
        }
    }
}

// Rate-limit detection is pattern-driven rather than hardcoded: some
// upstreams report throttling through 400 bodies, and operators need to
// turn that heuristic off when it misfires on genuine bad requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRules {
    #[serde(default = "default_true")]
    pub treat_bad_request_as_rate_limit: bool,
    #[serde(default = "default_rate_limit_patterns")]
    pub patterns: Vec<String>,
    #[serde(default = "default_rate_limit_retry_secs")]
    pub retry_delay_secs: u64,
}

fn default_rate_limit_patterns() -> Vec<String> {
    vec![
        "(?i)rate[ _-]?limit".to_string(),
        "(?i)too many requests".to_string(),
        "(?i)quota".to_string(),
        "(?i)throttl".to_string(),
    ]
}

fn default_rate_limit_retry_secs() -> u64 {
    60
}

impl Default for RateLimitRules {
    fn default() -> Self {
        Self {
            treat_bad_request_as_rate_limit: true,
            patterns: default_rate_limit_patterns(),
            retry_delay_secs: default_rate_limit_retry_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default = "default_hot_pool_size")]
    pub hot_pool_size: usize,
    #[serde(default = "default_max_record_age_secs")]
    pub max_record_age_secs: u64,
    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,
    #[serde(default = "default_flush_queue_size")]
    pub flush_queue_size: usize,
    // Unit price per million tokens; cost stays empty when unset.
    #[serde(default)]
    pub unit_cost_per_mtok: Option<f64>,
}

fn default_hot_pool_size() -> usize {
    10_000
}

fn default_max_record_age_secs() -> u64 {
    3_600
}

fn default_flush_batch_size() -> usize {
    64
}

fn default_flush_queue_size() -> usize {
    1_024
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            hot_pool_size: default_hot_pool_size(),
            max_record_age_secs: default_max_record_age_secs(),
            flush_batch_size: default_flush_batch_size(),
            flush_queue_size: default_flush_queue_size(),
            unit_cost_per_mtok: None,
        }
    }
}

impl AppConfig {
    pub fn new() -> Self {
        Self {
            server: ServerConfig::default(),
            strategy: StrategyConfig::default(),
            failover: FailoverConfig::default(),
            health_check: HealthCheckConfig::default(),
            rate_limit_rules: RateLimitRules::default(),
            upstream: UpstreamConfig::default(),
            tracking: TrackingConfig::default(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}
