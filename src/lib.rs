//! Service Gateway
//!
//! A health-aware reverse proxy that routes requests to registered upstream
//! services through pooled connections, with pluggable load balancing, a
//! real-time room broadcast hub and rolling request metrics.

pub mod api;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod middleware;
pub mod pool;

pub use error::{GatewayError, Result};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use broadcast::BroadcastHub;
use config::Settings;
use gateway::{
    health_check::{HealthMonitor, HealthProbe, HttpProbe},
    load_balancer::LoadBalancer,
    registry::ServiceRegistry,
    router::ProxyRouter,
};
use metrics::MetricsAggregator;
use middleware::auth::{StaticTokenVerifier, TokenVerifier};
use pool::{ConnectionPool, Connector, HttpConnector};

/// Application state shared across all handlers
pub struct AppState {
    pub settings: Settings,
    pub registry: Arc<ServiceRegistry>,
    pub monitor: Arc<HealthMonitor>,
    pub balancer: Arc<LoadBalancer>,
    pub pool: Arc<ConnectionPool>,
    pub router: Arc<ProxyRouter>,
    pub hub: Arc<BroadcastHub>,
    pub metrics: Arc<MetricsAggregator>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub started_at: DateTime<Utc>,
    pub(crate) started: Instant,
    pub(crate) system: Mutex<sysinfo::System>,
}

impl AppState {
    /// Wire every component from settings with the given transport and probe
    pub fn new(
        settings: Settings,
        connector: Arc<dyn Connector>,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self> {
        let monitor = Arc::new(HealthMonitor::new(probe, settings.health.probe_timeout()));
        let registry = Arc::new(ServiceRegistry::new(monitor.clone()));
        registry.initialize_from_config(&settings.services)?;

        let balancer = Arc::new(LoadBalancer::new());
        let pool = Arc::new(ConnectionPool::new(connector, settings.pool.clone()));
        let hub = Arc::new(BroadcastHub::new(settings.broadcast.clone()));
        let metrics = Arc::new(MetricsAggregator::new(hub.clone()));
        let router = Arc::new(ProxyRouter::new(
            registry.clone(),
            monitor.clone(),
            balancer.clone(),
            pool.clone(),
            metrics.clone(),
        ));
        let verifier: Arc<dyn TokenVerifier> =
            Arc::new(StaticTokenVerifier::new(settings.auth.api_keys.clone()));

        Ok(Self {
            settings,
            registry,
            monitor,
            balancer,
            pool,
            router,
            hub,
            metrics,
            verifier,
            started_at: Utc::now(),
            started: Instant::now(),
            system: Mutex::new(sysinfo::System::new()),
        })
    }

    /// State using the HTTP transport and HTTP health probe
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let connector = Arc::new(HttpConnector::new(settings.pool.connect_timeout()));
        Self::new(settings, connector, Arc::new(HttpProbe::new()))
    }

    /// Replace the token verifier used at the HTTP boundary
    pub fn with_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Start background loops and warm the pool
    pub async fn start(&self) {
        self.monitor
            .start(self.registry.clone(), self.settings.health.interval())
            .await;
        self.pool.start().await;
        self.hub.start().await;
        self.metrics
            .start(Duration::from_secs(self.settings.metrics.interval_secs.max(1)))
            .await;

        let warmup = self.settings.pool.warmup_connections;
        if warmup > 0 {
            let targets: Vec<String> = self
                .registry
                .get_all()
                .iter()
                .flat_map(|service| service.instance_urls())
                .collect();
            self.pool.warmup(&targets, warmup).await;
        }

        info!(services = self.registry.len(), "Gateway components started");
    }

    /// Stop background loops and close pooled connections
    pub async fn shutdown(&self) {
        self.monitor.stop().await;
        self.hub.shutdown().await;
        self.metrics.stop().await;
        self.pool.shutdown().await;
        info!("Gateway components stopped");
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}
