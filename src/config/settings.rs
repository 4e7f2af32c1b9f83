//! Gateway settings and configuration management

use crate::error::{GatewayError, Result};
use crate::gateway::load_balancer::LoadBalancingStrategy;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest request body the proxy buffers before forwarding
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Authentication boundary configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Tokens accepted by the bundled static verifier
    #[serde(default)]
    pub api_keys: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_keys: vec![],
        }
    }
}

/// HTTP-level rate limiting for proxied routes
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rps")]
    pub requests_per_second: u32,
    #[serde(default = "default_burst")]
    pub burst_size: u32,
}

fn default_rps() -> u32 {
    100
}

fn default_burst() -> u32 {
    200
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: default_rps(),
            burst_size: default_burst(),
        }
    }
}

/// Outbound connection pool limits and maintenance intervals
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_per_target")]
    pub max_per_target: usize,
    #[serde(default = "default_max_total")]
    pub max_total: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_pool_health_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Connections created per instance at startup
    #[serde(default)]
    pub warmup_connections: usize,
}

fn default_max_per_target() -> usize {
    10
}

fn default_max_total() -> usize {
    100
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_pool_health_interval() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    5000
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_target: default_max_per_target(),
            max_total: default_max_total(),
            idle_timeout_secs: default_idle_timeout(),
            health_check_interval_secs: default_pool_health_interval(),
            connect_timeout_ms: default_connect_timeout(),
            warmup_connections: 0,
        }
    }
}

/// Service probing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

fn default_health_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    5000
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

/// Real-time hub configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_max_messages")]
    pub max_messages_per_second: u32,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_max_missed")]
    pub max_missed_heartbeats: u32,
    /// Per-connection outbound queue depth
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

fn default_max_messages() -> u32 {
    10
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_max_missed() -> u32 {
    2
}

fn default_outbound_buffer() -> usize {
    256
}

impl BroadcastConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            max_messages_per_second: default_max_messages(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            max_missed_heartbeats: default_max_missed(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

/// Metrics recomputation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

fn default_metrics_interval() -> u64 {
    10
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_metrics_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// A backend instance, either a bare base address or an address with a weight
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum InstanceConfig {
    Url(String),
    Weighted { url: String, weight: u32 },
}

impl InstanceConfig {
    pub fn url(&self) -> &str {
        match self {
            InstanceConfig::Url(url) => url,
            InstanceConfig::Weighted { url, .. } => url,
        }
    }

    pub fn weight(&self) -> Option<u32> {
        match self {
            InstanceConfig::Url(_) => None,
            InstanceConfig::Weighted { weight, .. } => Some(*weight),
        }
    }
}

/// Backend service configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub name: String,
    /// Route prefix; defaults to `/{name}`
    #[serde(default)]
    pub prefix: Option<String>,
    /// Single base address, for services with one instance
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub strategy: LoadBalancingStrategy,
    /// Default weight for instances that do not carry one
    #[serde(default)]
    pub weight: Option<u32>,
}

fn default_health_check_path() -> String {
    "/health".to_string()
}

fn default_timeout() -> u64 {
    30000
}

fn default_retries() -> u32 {
    1
}

impl ServiceConfig {
    /// All configured instances, `url` first when both forms are given
    pub fn all_instances(&self) -> Vec<InstanceConfig> {
        let mut instances = Vec::with_capacity(self.instances.len() + 1);
        if let Some(url) = &self.url {
            instances.push(InstanceConfig::Url(url.clone()));
        }
        instances.extend(self.instances.iter().cloned());
        instances
    }

    pub fn route_prefix(&self) -> String {
        match &self.prefix {
            Some(prefix) => normalize_prefix(prefix),
            None => format!("/{}", self.name),
        }
    }
}

/// Ensure a leading slash and no trailing slash (except for the root prefix)
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn invalid(message: impl Into<String>) -> GatewayError {
    GatewayError::Config(config::ConfigError::Message(message.into()))
}

impl Settings {
    /// Load settings from `GATEWAY_CONFIG` (or `config/default`) and the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var("GATEWAY_CONFIG").unwrap_or_else(|_| "config/default".to_string());
        Self::load_from_path(path)
    }

    /// Load settings from a specific configuration file path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path
            .as_ref()
            .to_str()
            .ok_or_else(|| invalid("Configuration path is not valid UTF-8"))?
            .to_string();

        let config = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .add_source(File::with_name(&path).required(false))
            // Override with environment variables, e.g. GATEWAY__SERVER__PORT=9000
            .add_source(
                Environment::with_prefix("GATEWAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(invalid("Server port cannot be 0"));
        }
        if self.pool.max_per_target == 0 || self.pool.max_total == 0 {
            return Err(invalid("Pool limits must be greater than 0"));
        }
        if self.pool.idle_timeout_secs == 0 {
            return Err(invalid("Pool idle timeout must be greater than 0"));
        }
        let intervals = [
            ("pool.health_check_interval_secs", self.pool.health_check_interval_secs),
            ("health.interval_secs", self.health.interval_secs),
            ("broadcast.heartbeat_interval_secs", self.broadcast.heartbeat_interval_secs),
            ("metrics.interval_secs", self.metrics.interval_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, secs)| *secs == 0) {
            return Err(invalid(format!("{} must be greater than 0", name)));
        }
        if self.rate_limit.enabled && self.rate_limit.requests_per_second == 0 {
            return Err(invalid("Rate limit must be greater than 0 when enabled"));
        }
        if self.broadcast.max_messages_per_second == 0 {
            return Err(invalid("Broadcast rate limit must be greater than 0"));
        }
        if self.broadcast.max_missed_heartbeats == 0 {
            return Err(invalid("max_missed_heartbeats must be at least 1"));
        }

        let mut names = HashSet::new();
        let mut prefixes = HashSet::new();
        for service in &self.services {
            if service.name.is_empty() {
                return Err(invalid("Service name cannot be empty"));
            }
            if !names.insert(service.name.as_str()) {
                return Err(invalid(format!("Duplicate service name '{}'", service.name)));
            }
            if service.all_instances().is_empty() {
                return Err(invalid(format!(
                    "Service '{}' must have at least one instance",
                    service.name
                )));
            }
            if !prefixes.insert(service.route_prefix()) {
                return Err(invalid(format!(
                    "Service '{}' reuses route prefix '{}'",
                    service.name,
                    service.route_prefix()
                )));
            }
        }

        Ok(())
    }
}
