//! Request handlers

use axum::{
    body::Body,
    extract::State,
    http::Request,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::broadcast::HubStats;
use crate::error::GatewayError;
use crate::gateway::health_check::ServiceHealth;
use crate::gateway::router::ProxyRequest;
use crate::metrics::MetricsSnapshot;
use crate::middleware::auth::Identity;
use crate::middleware::request_id_of;
use crate::pool::PoolStats;
use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub services: BTreeMap<String, ServiceHealthEntry>,
}

#[derive(Debug, Serialize)]
pub struct ServiceHealthEntry {
    pub healthy: bool,
    pub response_time_ms: Option<u64>,
    pub last_check: DateTime<Utc>,
}

/// Health check endpoint; `degraded` when any service has no healthy instance
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let services: BTreeMap<String, ServiceHealthEntry> = state
        .registry
        .get_all()
        .iter()
        .map(|service| {
            let health = state.monitor.get_health(&service.name).unwrap_or_default();
            (
                service.name.clone(),
                ServiceHealthEntry {
                    healthy: health.healthy,
                    response_time_ms: health.response_time.map(|d| d.as_millis() as u64),
                    last_check: health.last_check,
                },
            )
        })
        .collect();

    let status = if services.values().all(|s| s.healthy) {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        timestamp: Utc::now(),
        services,
    })
}

/// Detailed status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub process: ProcessUsage,
    pub services: BTreeMap<String, ServiceStatus>,
    pub pool: PoolStats,
    pub metrics: MetricsSnapshot,
    pub broadcast: HubStats,
}

#[derive(Debug, Default, Serialize)]
pub struct ProcessUsage {
    pub memory_bytes: u64,
    pub cpu_usage_percent: f32,
    pub system_total_memory_bytes: u64,
    pub system_used_memory_bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub prefix: String,
    pub urls: Vec<String>,
    pub strategy: String,
    #[serde(flatten)]
    pub health: ServiceHealth,
    pub instances: Vec<InstanceStatus>,
}

#[derive(Debug, Serialize)]
pub struct InstanceStatus {
    pub url: String,
    pub weight: u32,
    pub active_connections: usize,
    #[serde(flatten)]
    pub health: ServiceHealth,
}

/// Detailed status endpoint
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let services = state
        .registry
        .get_all()
        .iter()
        .map(|service| {
            let instances = service
                .instances
                .iter()
                .map(|instance| InstanceStatus {
                    url: instance.url.clone(),
                    weight: instance.weight,
                    active_connections: state.pool.active_count(&instance.url),
                    health: state
                        .monitor
                        .instance_health(&service.name, &instance.url)
                        .unwrap_or_default(),
                })
                .collect();

            (
                service.name.clone(),
                ServiceStatus {
                    prefix: service.prefix.clone(),
                    urls: service.instance_urls(),
                    strategy: service.strategy.to_string(),
                    health: state.monitor.get_health(&service.name).unwrap_or_default(),
                    instances,
                },
            )
        })
        .collect();

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at,
        uptime_secs: state.uptime().as_secs(),
        process: process_usage(&state),
        services,
        pool: state.pool.stats(),
        metrics: state.metrics.snapshot(),
        broadcast: state.hub.stats(),
    })
}

fn process_usage(state: &AppState) -> ProcessUsage {
    let mut system = state.system.lock();
    system.refresh_memory();

    let mut usage = ProcessUsage {
        system_total_memory_bytes: system.total_memory(),
        system_used_memory_bytes: system.used_memory(),
        ..Default::default()
    };

    if let Ok(pid) = sysinfo::get_current_pid() {
        system.refresh_process(pid);
        if let Some(process) = system.process(pid) {
            usage.memory_bytes = process.memory();
            usage.cpu_usage_percent = process.cpu_usage();
        }
    }
    usage
}

/// Metrics endpoint
pub async fn metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

/// Fallback handler proxying every other path to its upstream service
pub async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let request_id = request_id_of(&request);
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, state.settings.server.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            return GatewayError::InvalidRequest(format!("Request body rejected: {}", e))
                .into_response_with_id(&request_id)
        }
    };

    let proxy_request = ProxyRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().and_then(forwarded_query),
        headers: parts.headers,
        body,
        request_id: request_id.clone(),
        identity: parts.extensions.get::<Identity>().cloned(),
    };

    match state.router.route(proxy_request).await {
        Ok(response) => response.into_response(),
        Err(e) => {
            debug!(request_id = %request_id, error = %e, "Proxy request failed");
            e.into_response_with_id(&request_id)
        }
    }
}

/// Query string without the gateway's own `token` parameter
fn forwarded_query(query: &str) -> Option<String> {
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty() && !pair.starts_with("token="))
        .collect();
    if kept.is_empty() {
        None
    } else {
        Some(kept.join("&"))
    }
}
