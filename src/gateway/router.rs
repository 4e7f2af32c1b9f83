//! Proxy router: path matching, instance selection, pooled forwarding and retries

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{GatewayError, Result, REQUEST_ID_HEADER};
use crate::gateway::health_check::HealthMonitor;
use crate::gateway::load_balancer::{Candidate, LoadBalancer};
use crate::gateway::registry::{ServiceDescriptor, ServiceRegistry};
use crate::metrics::MetricsAggregator;
use crate::middleware::auth::Identity;
use crate::pool::{ConnectionPool, UpstreamRequest, UpstreamResponse};

/// Header naming the service that answered
pub const SERVICE_HEADER: &str = "x-gateway-service";
/// Header carrying the gateway-measured latency
pub const LATENCY_HEADER: &str = "x-gateway-latency-ms";
/// Header carrying the authenticated identity upstream
pub const USER_HEADER: &str = "x-gateway-user";

const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
    header::CONTENT_LENGTH,
];

/// An inbound request to be proxied
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub request_id: String,
    pub identity: Option<Identity>,
}

impl ProxyRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            request_id: uuid::Uuid::new_v4().to_string(),
            identity: None,
        }
    }
}

/// An upstream response tagged with gateway metadata
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub service: String,
    pub instance: String,
    pub latency: Duration,
    pub attempts: u32,
    pub request_id: String,
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        let mut headers = strip_hop_by_hop(&self.headers);
        if let Ok(value) = HeaderValue::from_str(&self.service) {
            headers.insert(SERVICE_HEADER, value);
        }
        headers.insert(LATENCY_HEADER, HeaderValue::from(self.latency.as_millis() as u64));
        if let Ok(value) = HeaderValue::from_str(&self.request_id) {
            headers.insert(REQUEST_ID_HEADER, value);
        }

        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = headers;
        response
    }
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in HOP_BY_HOP {
        out.remove(name);
    }
    out
}

/// Reverse-proxy router
pub struct ProxyRouter {
    registry: Arc<ServiceRegistry>,
    monitor: Arc<HealthMonitor>,
    balancer: Arc<LoadBalancer>,
    pool: Arc<ConnectionPool>,
    metrics: Arc<MetricsAggregator>,
}

impl ProxyRouter {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        monitor: Arc<HealthMonitor>,
        balancer: Arc<LoadBalancer>,
        pool: Arc<ConnectionPool>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            registry,
            monitor,
            balancer,
            pool,
            metrics,
        }
    }

    /// Route a request to a healthy instance of the matching service
    pub async fn route(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        let started = Instant::now();
        let (service, upstream_path) = self
            .registry
            .match_route(&request.path)
            .ok_or_else(|| GatewayError::NotFound(request.path.clone()))?;

        let upstream = self.upstream_request(&request, &upstream_path);
        let max_attempts = service.retries + 1;
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_error: Option<GatewayError> = None;
        let mut attempts = 0;

        while attempts < max_attempts {
            let candidates = self.candidates(&service, &tried);
            let instance =
                match self
                    .balancer
                    .select(&service.name, service.strategy, &candidates)
                {
                    Ok(instance) => instance,
                    Err(e) => {
                        if last_error.is_none() {
                            last_error = Some(e);
                        }
                        break;
                    }
                };
            attempts += 1;
            tried.insert(instance.url.clone());

            match self.forward(&service, &instance.url, upstream.clone()).await {
                Ok(response) => {
                    let latency = started.elapsed();
                    self.metrics.record_request(latency, true);
                    debug!(
                        service = %service.name,
                        instance = %instance.url,
                        status = response.status.as_u16(),
                        latency_ms = latency.as_millis() as u64,
                        request_id = %request.request_id,
                        "Proxied request"
                    );
                    return Ok(ProxyResponse {
                        status: response.status,
                        headers: response.headers,
                        body: response.body,
                        service: service.name.clone(),
                        instance: instance.url,
                        latency,
                        attempts,
                        request_id: request.request_id,
                    });
                }
                Err(e) => {
                    warn!(
                        service = %service.name,
                        instance = %instance.url,
                        attempt = attempts,
                        error = %e,
                        request_id = %request.request_id,
                        "Proxy attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        self.metrics.record_request(started.elapsed(), false);
        Err(last_error.unwrap_or_else(|| GatewayError::unavailable(&service.name, "no healthy instance")))
    }

    /// Forward once through a pooled connection to `instance`
    async fn forward(
        &self,
        service: &ServiceDescriptor,
        instance: &str,
        request: UpstreamRequest,
    ) -> Result<UpstreamResponse> {
        let lease = match self.pool.acquire(instance).await {
            Ok(lease) => lease,
            Err(e @ GatewayError::PoolExhausted(_)) => return Err(e),
            Err(e) => {
                self.monitor.mark_unhealthy(&service.name, instance, e.to_string());
                return Err(GatewayError::unavailable(&service.name, e.to_string()));
            }
        };

        match tokio::time::timeout(service.timeout, lease.transport().send(request)).await {
            Ok(Ok(response)) => {
                self.pool.release(lease.id());
                Ok(response)
            }
            Ok(Err(e)) => {
                self.pool.remove(lease.id()).await;
                self.monitor.mark_unhealthy(&service.name, instance, e.to_string());
                Err(GatewayError::unavailable(&service.name, e.to_string()))
            }
            Err(_) => {
                self.pool.release_for_check(lease.id());
                Err(GatewayError::UpstreamTimeout(format!(
                    "{} did not respond within {:?}",
                    service.name, service.timeout
                )))
            }
        }
    }

    /// Instances not yet tried, with their health and load
    fn candidates(&self, service: &ServiceDescriptor, tried: &HashSet<String>) -> Vec<Candidate> {
        service
            .instances
            .iter()
            .filter(|instance| !tried.contains(&instance.url))
            .map(|instance| {
                let health = self.monitor.instance_health(&service.name, &instance.url);
                Candidate {
                    url: instance.url.clone(),
                    weight: instance.weight,
                    healthy: health.as_ref().map_or(true, |h| h.healthy),
                    response_time: health.and_then(|h| h.response_time),
                    active_connections: self.pool.active_count(&instance.url),
                }
            })
            .collect()
    }

    fn upstream_request(&self, request: &ProxyRequest, upstream_path: &str) -> UpstreamRequest {
        let mut headers = strip_hop_by_hop(&request.headers);
        if let Ok(value) = HeaderValue::from_str(&request.request_id) {
            headers.insert(REQUEST_ID_HEADER, value);
        }
        headers.remove(USER_HEADER);
        if let Some(identity) = &request.identity {
            if let Ok(value) = HeaderValue::from_str(&identity.subject) {
                headers.insert(USER_HEADER, value);
            }
        }

        let path_and_query = match &request.query {
            Some(query) if !query.is_empty() => format!("{}?{}", upstream_path, query),
            _ => upstream_path.to_string(),
        };

        UpstreamRequest {
            method: request.method.clone(),
            path_and_query,
            headers,
            body: request.body.clone(),
        }
    }
}
