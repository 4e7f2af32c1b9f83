//! HTTP middleware: authentication boundary and request rate limiting

pub mod auth;
pub mod rate_limit;

/// Paths that bypass authentication and rate limiting
pub(crate) fn is_public_path(path: &str) -> bool {
    matches!(path, "/health" | "/status" | "/metrics")
}

/// Correlation id set by the request-id layer, or a fresh one
pub(crate) fn request_id_of<B>(request: &axum::http::Request<B>) -> String {
    request
        .headers()
        .get(crate::error::REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}
