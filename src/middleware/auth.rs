//! Token authentication middleware

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header::AUTHORIZATION, Request},
    response::Response,
};
use futures::future::BoxFuture;
use serde::Serialize;
use std::{
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::middleware::{is_public_path, request_id_of};

/// Authenticated caller, attached to request extensions
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub subject: String,
}

/// Result of checking a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Allow(Option<Identity>),
    Deny(String),
}

/// Pass/fail token check used at the HTTP boundary
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: Option<&str>) -> Verification;
}

/// Verifier backed by a static list of API keys
///
/// An empty list allows every request without attaching an identity.
pub struct StaticTokenVerifier {
    api_keys: Vec<String>,
}

impl StaticTokenVerifier {
    pub fn new(api_keys: Vec<String>) -> Self {
        Self { api_keys }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: Option<&str>) -> Verification {
        if self.api_keys.is_empty() {
            return Verification::Allow(None);
        }

        match token {
            Some(token) => match self.api_keys.iter().position(|key| key == token) {
                Some(index) => Verification::Allow(Some(Identity {
                    subject: format!("api-key-{}", index + 1),
                })),
                None => Verification::Deny("Invalid API key".to_string()),
            },
            None => Verification::Deny(
                "API key required. Provide via Authorization header: 'Bearer YOUR_API_KEY' or ?token=".to_string(),
            ),
        }
    }
}

/// Authentication layer
#[derive(Clone)]
pub struct AuthLayer {
    verifier: Arc<dyn TokenVerifier>,
}

impl AuthLayer {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { verifier }
    }

    /// Layer using the static key verifier
    pub fn with_api_keys(api_keys: Vec<String>) -> Self {
        Self::new(Arc::new(StaticTokenVerifier::new(api_keys)))
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            verifier: self.verifier.clone(),
        }
    }
}

/// Authentication middleware service
#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    verifier: Arc<dyn TokenVerifier>,
}

impl<S> Service<Request<Body>> for AuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        if is_public_path(request.uri().path()) {
            let future = self.inner.call(request);
            return Box::pin(async move { future.await });
        }

        let token = extract_token(&request);
        let verifier = self.verifier.clone();

        // The ready service is taken; a fresh clone stays behind for the next call
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match verifier.verify(token.as_deref()).await {
                Verification::Allow(identity) => {
                    if let Some(identity) = identity {
                        debug!(subject = %identity.subject, "Request authenticated");
                        request.extensions_mut().insert(identity);
                    }
                    inner.call(request).await
                }
                Verification::Deny(reason) => {
                    let request_id = request_id_of(&request);
                    warn!(
                        path = %request.uri().path(),
                        request_id = %request_id,
                        reason = %reason,
                        "Authentication failed"
                    );
                    Ok(GatewayError::AuthenticationFailed(reason).into_response_with_id(&request_id))
                }
            }
        })
    }
}

/// Token from `Authorization` (with or without `Bearer `) or the `token` query parameter
fn extract_token(request: &Request<Body>) -> Option<String> {
    let from_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.strip_prefix("Bearer ").unwrap_or(h).trim().to_string())
        .filter(|t| !t.is_empty());

    from_header.or_else(|| {
        request.uri().query().and_then(|query| {
            query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(name, _)| *name == "token")
                .map(|(_, value)| value.to_string())
                .filter(|t| !t.is_empty())
        })
    })
}
