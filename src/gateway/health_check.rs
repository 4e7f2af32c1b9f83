//! Health monitor: periodic probing of every registered service instance

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::gateway::registry::{ServiceDescriptor, ServiceRegistry};

/// Live availability status of a service instance
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub healthy: bool,
    #[serde(rename = "response_time_ms", serialize_with = "serialize_millis")]
    pub response_time: Option<Duration>,
    pub last_check: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl Default for ServiceHealth {
    fn default() -> Self {
        Self {
            healthy: true, // Assume healthy until proven otherwise
            response_time: None,
            last_check: Utc::now(),
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

impl ServiceHealth {
    fn record_success(&mut self, response_time: Duration) {
        self.healthy = true;
        self.response_time = Some(response_time);
        self.last_check = Utc::now();
        self.consecutive_failures = 0;
        self.last_error = None;
    }

    fn record_failure(&mut self, error: String) {
        self.healthy = false;
        self.last_check = Utc::now();
        self.consecutive_failures += 1;
        self.last_error = Some(error);
    }

    /// Service-level view over instance records: healthy if any instance is
    fn aggregate<'a>(instances: impl Iterator<Item = &'a ServiceHealth>) -> Option<ServiceHealth> {
        let instances: Vec<&ServiceHealth> = instances.collect();
        if instances.is_empty() {
            return None;
        }

        let healthy = instances.iter().any(|h| h.healthy);
        let response_time = instances
            .iter()
            .filter(|h| h.healthy)
            .filter_map(|h| h.response_time)
            .min();
        let last_check = instances.iter().map(|h| h.last_check).max().unwrap_or_else(Utc::now);
        let consecutive_failures = instances.iter().map(|h| h.consecutive_failures).min().unwrap_or(0);
        let last_error = instances
            .iter()
            .filter(|h| h.last_error.is_some())
            .max_by_key(|h| h.last_check)
            .and_then(|h| h.last_error.clone());

        Some(ServiceHealth {
            healthy,
            response_time,
            last_check,
            consecutive_failures,
            last_error,
        })
    }
}

fn serialize_millis<S: serde::Serializer>(
    value: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}

/// Issues one health request against an instance
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe `url` and return the measured response time, or the failure reason
    async fn probe(&self, url: &str, timeout: Duration) -> std::result::Result<Duration, String>;
}

/// HTTP GET probe; any 2xx status counts as healthy
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, url: &str, timeout: Duration) -> std::result::Result<Duration, String> {
        let started = Instant::now();
        match self.client.get(url).timeout(timeout).send().await {
            Ok(response) if response.status().is_success() => Ok(started.elapsed()),
            Ok(response) => Err(format!("health check returned {}", response.status())),
            Err(e) if e.is_timeout() => Err(format!("health check timed out after {:?}", timeout)),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Health monitor.
///
/// Sole writer of the health table. Everything else reads snapshots or
/// reports failures through [`HealthMonitor::mark_unhealthy`].
pub struct HealthMonitor {
    probe: Arc<dyn HealthProbe>,
    probe_timeout: Duration,
    /// service name -> instance url -> health
    health: DashMap<String, HashMap<String, ServiceHealth>>,
    check_task: RwLock<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn HealthProbe>, probe_timeout: Duration) -> Self {
        Self {
            probe,
            probe_timeout,
            health: DashMap::new(),
            check_task: RwLock::new(None),
        }
    }

    /// HTTP probing with a 5 second timeout
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(HttpProbe::new()), Duration::from_secs(5))
    }

    /// Start tracking a service's instances; existing records are kept
    pub fn track(&self, descriptor: &ServiceDescriptor) {
        let mut entry = self.health.entry(descriptor.name.clone()).or_default();
        let urls = descriptor.instance_urls();
        entry.retain(|url, _| urls.contains(url));
        for url in urls {
            entry.entry(url).or_default();
        }
    }

    /// Stop tracking a service
    pub fn forget(&self, service: &str) {
        self.health.remove(service);
    }

    /// Start the probing background task
    pub async fn start(self: &Arc<Self>, registry: Arc<ServiceRegistry>, interval: Duration) {
        let monitor = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                let services = registry.get_all();
                join_all(services.iter().map(|service| monitor.probe(service))).await;
                tokio::time::sleep(interval).await;
            }
        });

        if let Some(previous) = self.check_task.write().await.replace(handle) {
            previous.abort();
        }
        info!(interval_secs = interval.as_secs(), "Started health check background task");
    }

    /// Stop the probing background task
    pub async fn stop(&self) {
        if let Some(handle) = self.check_task.write().await.take() {
            handle.abort();
            info!("Stopped health check background task");
        }
    }

    /// Probe every instance of a service and record the outcomes
    pub async fn probe(&self, service: &ServiceDescriptor) -> Option<ServiceHealth> {
        let checks = service.instances.iter().map(|instance| {
            let url = format!("{}{}", instance.url, service.health_check_path);
            let instance_url = instance.url.clone();
            async move {
                let outcome = match tokio::time::timeout(
                    self.probe_timeout,
                    self.probe.probe(&url, self.probe_timeout),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(format!("health check timed out after {:?}", self.probe_timeout)),
                };
                (instance_url, outcome)
            }
        });

        for (instance, outcome) in join_all(checks).await {
            match outcome {
                Ok(response_time) => self.record_success(&service.name, &instance, response_time),
                Err(error) => self.record_failure(&service.name, &instance, error),
            }
        }

        self.get_health(&service.name)
    }

    /// Pessimistically mark an instance unhealthy after a failed request
    pub fn mark_unhealthy(&self, service: &str, instance: &str, error: impl Into<String>) {
        self.record_failure(service, instance, error.into());
    }

    fn record_success(&self, service: &str, instance: &str, response_time: Duration) {
        let Some(mut instances) = self.health.get_mut(service) else {
            return;
        };
        let Some(status) = instances.get_mut(instance) else {
            return;
        };

        if !status.healthy {
            info!(service = %service, instance = %instance, "Instance recovered and marked healthy");
        }
        status.record_success(response_time);

        debug!(
            service = %service,
            instance = %instance,
            response_time_ms = response_time.as_millis() as u64,
            "Health check passed"
        );
    }

    fn record_failure(&self, service: &str, instance: &str, error: String) {
        let Some(mut instances) = self.health.get_mut(service) else {
            return;
        };
        let Some(status) = instances.get_mut(instance) else {
            return;
        };

        let was_healthy = status.healthy;
        status.record_failure(error);

        if was_healthy {
            warn!(
                service = %service,
                instance = %instance,
                failures = status.consecutive_failures,
                error = status.last_error.as_deref().unwrap_or_default(),
                "Instance marked unhealthy"
            );
        } else {
            debug!(
                service = %service,
                instance = %instance,
                failures = status.consecutive_failures,
                "Health check failed"
            );
        }
    }

    /// Last recorded service-level health; never probes
    pub fn get_health(&self, service: &str) -> Option<ServiceHealth> {
        self.health
            .get(service)
            .and_then(|instances| ServiceHealth::aggregate(instances.values()))
    }

    /// Last recorded health of one instance
    pub fn instance_health(&self, service: &str, instance: &str) -> Option<ServiceHealth> {
        self.health
            .get(service)
            .and_then(|instances| instances.get(instance).cloned())
    }

    /// Whether an instance is currently considered healthy
    pub fn is_healthy(&self, service: &str, instance: &str) -> bool {
        self.instance_health(service, instance)
            .map(|s| s.healthy)
            .unwrap_or(true) // Assume healthy if not checked yet
    }

    /// Get health summary (total, healthy, unhealthy) over services
    pub fn get_health_summary(&self) -> (usize, usize, usize) {
        let total = self.health.len();
        let healthy = self
            .health
            .iter()
            .filter(|entry| entry.values().any(|h| h.healthy))
            .count();
        (total, healthy, total - healthy)
    }

    /// Services with no healthy instance
    pub fn get_unhealthy_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .health
            .iter()
            .filter(|entry| !entry.values().any(|h| h.healthy))
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}
