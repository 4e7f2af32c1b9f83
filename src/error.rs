//! Common error types for the service gateway

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Gateway-wide error type
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("No route matches path: {0}")]
    NotFound(String),

    #[error("Service not registered: {0}")]
    ServiceNotRegistered(String),

    #[error("Service already registered: {0}")]
    ServiceAlreadyRegistered(String),

    #[error("Service unavailable: {service}: {reason}")]
    ServiceUnavailable { service: String, reason: String },

    #[error("Connection pool limit reached for target: {0}")]
    PoolExhausted(String),

    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("Upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Shorthand for the "no healthy instance" condition of a service.
    pub fn unavailable(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// HTTP status, error type and machine-readable code for this error.
    fn classify(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            GatewayError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error", "config_error"),
            GatewayError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error", "io_error"),
            GatewayError::Json(_) => (StatusCode::BAD_REQUEST, "invalid_request_error", "invalid_json"),
            GatewayError::HttpClient(_) => (StatusCode::BAD_GATEWAY, "upstream_error", "upstream_transport_error"),
            GatewayError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found_error", "route_not_found"),
            GatewayError::ServiceNotRegistered(_) => (StatusCode::NOT_FOUND, "not_found_error", "service_not_registered"),
            GatewayError::ServiceAlreadyRegistered(_) => (StatusCode::CONFLICT, "invalid_request_error", "service_already_registered"),
            GatewayError::ServiceUnavailable { .. } => (StatusCode::SERVICE_UNAVAILABLE, "server_error", "service_unavailable"),
            GatewayError::PoolExhausted(_) => (StatusCode::SERVICE_UNAVAILABLE, "server_error", "pool_limit_reached"),
            GatewayError::UpstreamTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout_error", "upstream_timeout"),
            GatewayError::UpstreamTransport(_) => (StatusCode::BAD_GATEWAY, "upstream_error", "upstream_transport_error"),
            GatewayError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error", "rate_limited"),
            GatewayError::Protocol(_) => (StatusCode::BAD_REQUEST, "invalid_request_error", "protocol_error"),
            GatewayError::AuthenticationFailed(_) => (StatusCode::UNAUTHORIZED, "authentication_error", "invalid_token"),
            GatewayError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request_error", "invalid_request"),
            GatewayError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error", "internal_error"),
        }
    }

    /// Machine-readable code, also used for real-time `error` messages.
    pub fn code(&self) -> &'static str {
        self.classify().2
    }

    /// HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        self.classify().0
    }

    /// Build the structured error response carrying a correlation id.
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        let (status, error_type, code) = self.classify();

        let body = Json(ErrorResponse {
            error: ErrorDetail {
                message: self.to_string(),
                r#type: error_type.to_string(),
                code: code.to_string(),
                request_id: request_id.to_string(),
            },
        });

        let mut response = (status, body).into_response();
        if let Ok(value) = HeaderValue::from_str(request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }
}

/// Header carrying the request correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: String,
    pub code: String,
    pub request_id: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.into_response_with_id(&request_id)
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, GatewayError>;
