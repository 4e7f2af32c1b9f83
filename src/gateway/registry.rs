//! Service registry: the set of known backend services and their descriptors

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::settings::{normalize_prefix, ServiceConfig};
use crate::error::{GatewayError, Result};
use crate::gateway::health_check::HealthMonitor;
use crate::gateway::load_balancer::LoadBalancingStrategy;

/// One reachable instance of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub url: String,
    pub weight: u32,
}

/// Static description of a backend and how to reach, probe and balance it
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub prefix: String,
    pub instances: Vec<Instance>,
    pub health_check_path: String,
    pub timeout: Duration,
    pub retries: u32,
    pub strategy: LoadBalancingStrategy,
    pub weight: Option<u32>,
}

impl ServiceDescriptor {
    /// Descriptor with defaults: prefix `/{name}`, `/health` probe, 30s timeout, one retry
    pub fn new<I, S>(name: impl Into<String>, instances: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        Self {
            prefix: format!("/{}", name),
            name,
            instances: instances
                .into_iter()
                .map(|url| Instance {
                    url: trim_url(url.into()),
                    weight: 1,
                })
                .collect(),
            health_check_path: "/health".to_string(),
            timeout: Duration::from_secs(30),
            retries: 1,
            strategy: LoadBalancingStrategy::RoundRobin,
            weight: None,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        let default_weight = config.weight.unwrap_or(1);
        Self {
            name: config.name.clone(),
            prefix: config.route_prefix(),
            instances: config
                .all_instances()
                .iter()
                .map(|instance| Instance {
                    url: trim_url(instance.url().to_string()),
                    weight: instance.weight().unwrap_or(default_weight),
                })
                .collect(),
            health_check_path: config.health_check_path.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            retries: config.retries,
            strategy: config.strategy,
            weight: config.weight,
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = normalize_prefix(prefix);
        self
    }

    pub fn with_strategy(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_health_check_path(mut self, path: &str) -> Self {
        self.health_check_path = path.to_string();
        self
    }

    pub fn with_weights(mut self, weights: &[u32]) -> Self {
        for (instance, weight) in self.instances.iter_mut().zip(weights) {
            instance.weight = *weight;
        }
        self
    }

    pub fn instance_urls(&self) -> Vec<String> {
        self.instances.iter().map(|i| i.url.clone()).collect()
    }

    /// Strip this service's prefix from `path` if it matches at a segment boundary
    pub fn strip_prefix(&self, path: &str) -> Option<String> {
        if self.prefix == "/" {
            return Some(path.to_string());
        }
        let rest = path.strip_prefix(self.prefix.as_str())?;
        if rest.is_empty() {
            Some("/".to_string())
        } else if rest.starts_with('/') {
            Some(rest.to_string())
        } else {
            None
        }
    }
}

fn trim_url(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

/// Registry of services, keyed by name.
///
/// Registration and reconfiguration keep the health table in step, so a
/// freshly added instance is usable before its first probe.
pub struct ServiceRegistry {
    services: DashMap<String, Arc<ServiceDescriptor>>,
    monitor: Arc<HealthMonitor>,
}

impl ServiceRegistry {
    pub fn new(monitor: Arc<HealthMonitor>) -> Self {
        Self {
            services: DashMap::new(),
            monitor,
        }
    }

    /// Register all services from configuration
    pub fn initialize_from_config(&self, configs: &[ServiceConfig]) -> Result<()> {
        for config in configs {
            self.register(ServiceDescriptor::from_config(config))?;
        }
        Ok(())
    }

    /// Add a service; fails if its name or prefix is already taken
    pub fn register(&self, descriptor: ServiceDescriptor) -> Result<Arc<ServiceDescriptor>> {
        if descriptor.instances.is_empty() {
            return Err(GatewayError::InvalidRequest(format!(
                "service '{}' has no instances",
                descriptor.name
            )));
        }
        if let Some(clash) = self
            .services
            .iter()
            .find(|s| s.prefix == descriptor.prefix && s.name != descriptor.name)
        {
            return Err(GatewayError::InvalidRequest(format!(
                "prefix '{}' already used by service '{}'",
                descriptor.prefix,
                clash.name
            )));
        }

        let descriptor = Arc::new(descriptor);
        match self.services.entry(descriptor.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(GatewayError::ServiceAlreadyRegistered(descriptor.name.clone()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(descriptor.clone());
            }
        }

        self.monitor.track(&descriptor);
        info!(
            service = %descriptor.name,
            prefix = %descriptor.prefix,
            instances = descriptor.instances.len(),
            strategy = %descriptor.strategy,
            "Registered service"
        );
        Ok(descriptor)
    }

    /// Replace the descriptor of an existing service
    pub fn reconfigure(&self, descriptor: ServiceDescriptor) -> Result<Arc<ServiceDescriptor>> {
        if !self.services.contains_key(&descriptor.name) {
            return Err(GatewayError::ServiceNotRegistered(descriptor.name.clone()));
        }
        if descriptor.instances.is_empty() {
            return Err(GatewayError::InvalidRequest(format!(
                "service '{}' has no instances",
                descriptor.name
            )));
        }

        let descriptor = Arc::new(descriptor);
        self.services
            .insert(descriptor.name.clone(), descriptor.clone());
        self.monitor.track(&descriptor);
        info!(service = %descriptor.name, "Reconfigured service");
        Ok(descriptor)
    }

    /// Remove a service and its health records
    pub fn deregister(&self, name: &str) -> Option<Arc<ServiceDescriptor>> {
        let (_, descriptor) = self.services.remove(name)?;
        self.monitor.forget(name);
        info!(service = %name, "Deregistered service");
        Some(descriptor)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServiceDescriptor>> {
        self.services.get(name).map(|s| s.clone())
    }

    /// All services, sorted by name
    pub fn get_all(&self) -> Vec<Arc<ServiceDescriptor>> {
        let mut all: Vec<_> = self.services.iter().map(|s| s.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Longest-prefix match; returns the service and the path with its prefix removed
    pub fn match_route(&self, path: &str) -> Option<(Arc<ServiceDescriptor>, String)> {
        self.services
            .iter()
            .filter_map(|s| s.strip_prefix(path).map(|rest| (s.clone(), rest)))
            .max_by_key(|(s, _)| s.prefix.len())
    }
}
