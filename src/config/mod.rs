//! Configuration module

pub mod settings;

pub use settings::{
    AuthConfig, BroadcastConfig, HealthConfig, InstanceConfig, LoggingConfig, MetricsConfig,
    PoolConfig, RateLimitConfig, ServerConfig, ServiceConfig, Settings,
};
