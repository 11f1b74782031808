pub mod config;
pub mod endpoint;

pub use config::{
    AppConfig, FailoverConfig, HealthCheckConfig, RateLimitRules, ServerConfig, StrategyConfig,
    StrategyKind, TrackingConfig, UpstreamConfig,
};
pub use endpoint::{mask_key, AuthCredential, CredentialEntry, EndpointConfig};
