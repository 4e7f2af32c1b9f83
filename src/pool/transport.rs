//! Outbound transports: the handles a pooled connection wraps

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::Client;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{GatewayError, Result};

/// Protocol spoken over a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Http,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::Http => f.write_str("http"),
        }
    }
}

/// A request as forwarded to an upstream instance
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    /// Path (prefix already stripped) plus query string
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// An upstream response
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// An open transport to one target
#[async_trait]
pub trait Transport: Send + Sync {
    /// Forward one request; errors are transport-level failures
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse>;

    /// Check the transport is usable, returning the round-trip time
    async fn check(&self) -> Result<Duration>;

    /// Release the underlying resources
    async fn close(&self);
}

/// Creates transports for a target
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &str) -> Result<Arc<dyn Transport>>;

    fn protocol(&self) -> ProtocolKind;
}

/// HTTP connector: one dedicated keep-alive client per pooled connection
pub struct HttpConnector {
    connect_timeout: Duration,
}

impl HttpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, target: &str) -> Result<Arc<dyn Transport>> {
        let base = reqwest::Url::parse(target)
            .map_err(|e| GatewayError::UpstreamTransport(format!("invalid target {}: {}", target, e)))?;
        let authority = socket_authority(&base)?;

        let client = Client::builder()
            .connect_timeout(self.connect_timeout)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| GatewayError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        let transport = HttpTransport {
            base: target.trim_end_matches('/').to_string(),
            authority,
            client,
            connect_timeout: self.connect_timeout,
        };
        transport.check().await?;
        debug!(upstream = %target, "Opened HTTP transport");

        Ok(Arc::new(transport))
    }

    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Http
    }
}

fn socket_authority(url: &reqwest::Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| GatewayError::UpstreamTransport(format!("target {} has no host", url)))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| GatewayError::UpstreamTransport(format!("target {} has no port", url)))?;
    Ok(format!("{}:{}", host, port))
}

/// HTTP transport bound to one base address
pub struct HttpTransport {
    base: String,
    authority: String,
    client: Client,
    connect_timeout: Duration,
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        let url = format!("{}{}", self.base, request.path_and_query);
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| GatewayError::InvalidRequest(format!("unsupported method: {}", e)))?;

        let mut builder = self.client.request(method, &url);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name.as_str(), value.as_bytes());
        }

        let response = builder
            .body(request.body)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamTransport(format!("{}: {}", self.base, e)))?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|e| GatewayError::UpstreamTransport(format!("invalid upstream status: {}", e)))?;
        let mut headers = HeaderMap::new();
        for (name, value) in response.headers() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::UpstreamTransport(format!("{}: {}", self.base, e)))?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }

    async fn check(&self) -> Result<Duration> {
        let started = Instant::now();
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.authority)).await {
            Ok(Ok(_stream)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(GatewayError::UpstreamTransport(format!(
                "{} unreachable: {}",
                self.authority, e
            ))),
            Err(_) => Err(GatewayError::UpstreamTimeout(format!(
                "connect to {} exceeded {:?}",
                self.authority, self.connect_timeout
            ))),
        }
    }

    async fn close(&self) {
        debug!(upstream = %self.base, "Closed HTTP transport");
    }
}
