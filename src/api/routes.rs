//! API route definitions

use axum::{routing::get, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::api::{handlers, ws};
use crate::middleware::{auth::AuthLayer, rate_limit::RateLimitLayer};
use crate::AppState;

/// Create the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let settings = &state.settings;

    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/status", get(handlers::status))
        .route("/metrics", get(handlers::metrics))
        .route("/ws", get(ws::ws_handler))
        .fallback(handlers::proxy_handler)
        .with_state(state.clone());

    if settings.auth.enabled {
        router = router.layer(AuthLayer::new(state.verifier.clone()));
    }

    // Applied outside auth so rejected callers still consume quota
    if settings.rate_limit.enabled {
        router = router.layer(RateLimitLayer::from_config(&settings.rate_limit));
    }

    router.layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(CorsLayer::permissive()),
    )
}
