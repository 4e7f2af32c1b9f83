//! Functional tests for proxy routing against mock upstream services

use axum::{
    body::Body,
    http::{header::AUTHORIZATION, Request, StatusCode},
    response::Response,
    Router,
};
use service_gateway::{
    api::routes::create_router,
    config::{InstanceConfig, ServiceConfig, Settings},
    gateway::load_balancer::LoadBalancingStrategy,
    AppState,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn service(name: &str, urls: &[String]) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        prefix: None,
        url: None,
        instances: urls.iter().cloned().map(InstanceConfig::Url).collect(),
        health_check_path: "/health".to_string(),
        timeout_ms: 5_000,
        retries: 1,
        strategy: LoadBalancingStrategy::RoundRobin,
        weight: None,
    }
}

fn test_app(services: Vec<ServiceConfig>) -> (Arc<AppState>, Router) {
    let mut settings = Settings::default();
    settings.rate_limit.enabled = false;
    settings.services = services;

    let state = Arc::new(AppState::from_settings(settings).unwrap());
    let router = create_router(state.clone());
    (state, router)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// An address nothing listens on
async fn dead_address() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_routes_around_unhealthy_instance() {
    let a1 = MockServer::start().await;
    let a2 = MockServer::start().await;
    let b = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/x"))
        .respond_with(ResponseTemplate::new(200).set_body_string("a1"))
        .expect(0)
        .mount(&a1)
        .await;
    Mock::given(method("GET"))
        .and(path("/x"))
        .respond_with(ResponseTemplate::new(200).set_body_string("a2"))
        .expect(10)
        .mount(&a2)
        .await;
    Mock::given(method("GET"))
        .and(path("/y"))
        .respond_with(ResponseTemplate::new(200).set_body_string("b"))
        .expect(1)
        .mount(&b)
        .await;

    let (state, app) = test_app(vec![
        service("a", &[a1.uri(), a2.uri()]),
        service("b", &[b.uri()]),
    ]);
    state.monitor.mark_unhealthy("a", &a1.uri(), "probe failed");

    for _ in 0..10 {
        let response = app.clone().oneshot(get("/a/x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-gateway-service"], "a");
        assert!(response.headers().contains_key("x-gateway-latency-ms"));
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"a2");
    }

    let response = app.oneshot(get("/b/y")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-gateway-service"], "b");
}

#[tokio::test]
async fn test_unmatched_path_returns_structured_404() {
    let (_, app) = test_app(vec![]);

    let response = app.oneshot(get("/nowhere/at/all")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let request_id = response.headers()["x-request-id"]
        .to_str()
        .unwrap()
        .to_string();
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "route_not_found");
    assert_eq!(body["error"]["request_id"], request_id.as_str());
}

#[tokio::test]
async fn test_upstream_error_status_passes_through() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(418).set_body_string("teapot"))
        .mount(&upstream)
        .await;

    let (_, app) = test_app(vec![service("shop", &[upstream.uri()])]);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/shop/orders")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
}

#[tokio::test]
async fn test_forwards_query_identity_and_request_id() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "rust"))
        .and(header("x-gateway-user", "api-key-1"))
        .and(header("x-request-id", "req-fwd-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&upstream)
        .await;

    let mut settings = Settings::default();
    settings.rate_limit.enabled = false;
    settings.auth.api_keys = vec!["secret".to_string()];
    settings.services = vec![service("docs", &[upstream.uri()])];
    let state = Arc::new(AppState::from_settings(settings).unwrap());
    let app = create_router(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/docs/search?q=rust")
                .header(AUTHORIZATION, "Bearer secret")
                .header("x-request-id", "req-fwd-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "req-fwd-1");

    let response = app.oneshot(get("/docs/search?q=rust")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_transport_failure_retries_on_other_instance() {
    let dead = dead_address().await;
    let live = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .mount(&live)
        .await;

    let (state, app) = test_app(vec![service("svc", &[dead.clone(), live.uri()])]);

    let response = app.oneshot(get("/svc/ping")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!state.monitor.is_healthy("svc", &dead));
    assert!(state.monitor.is_healthy("svc", &live.uri()));
}

#[tokio::test]
async fn test_single_dead_instance_is_service_unavailable() {
    let dead = dead_address().await;
    let (_, app) = test_app(vec![service("svc", &[dead])]);

    let response = app.oneshot(get("/svc/ping")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert!(body["error"]["message"].as_str().unwrap().contains("svc"));
    assert!(body["error"]["request_id"].is_string());
}

#[tokio::test]
async fn test_slow_upstream_times_out() {
    let slow = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&slow)
        .await;

    let mut config = service("slow", &[slow.uri()]);
    config.timeout_ms = 100;
    config.retries = 0;
    let (state, app) = test_app(vec![config]);

    let response = app.oneshot(get("/slow/anything")).await.unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "upstream_timeout");

    // A timeout does not mark the instance down
    assert!(state.monitor.is_healthy("slow", &slow.uri()));
    assert_eq!(state.pool.stats().active, 0);
}

#[tokio::test]
async fn test_health_endpoint_reports_degraded() {
    let upstream = MockServer::start().await;
    let (state, app) = test_app(vec![
        service("a", &[upstream.uri()]),
        service("b", &[upstream.uri()]),
    ]);

    let body = body_json(app.clone().oneshot(get("/health")).await.unwrap()).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["services"]["a"]["healthy"], true);

    state.monitor.mark_unhealthy("b", &upstream.uri(), "down");
    let body = body_json(app.oneshot(get("/health")).await.unwrap()).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["services"]["b"]["healthy"], false);
    assert!(body["services"]["b"]["last_check"].is_string());
}

#[tokio::test]
async fn test_status_and_metrics_endpoints() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let (state, app) = test_app(vec![service("api", &[upstream.uri()])]);

    for _ in 0..3 {
        let response = app.clone().oneshot(get("/api/items")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    state.metrics.recompute();

    let body = body_json(app.clone().oneshot(get("/metrics")).await.unwrap()).await;
    assert_eq!(body["total_requests"], 3);
    assert_eq!(body["successful_requests"], 3);

    let body = body_json(app.oneshot(get("/status")).await.unwrap()).await;
    let api = &body["services"]["api"];
    assert_eq!(api["prefix"], "/api");
    assert_eq!(api["strategy"], "round-robin");
    assert_eq!(api["instances"].as_array().unwrap().len(), 1);
    assert_eq!(body["pool"]["total"], 1);
    assert_eq!(body["metrics"]["total_requests"], 3);
    assert!(body["broadcast"]["connections"].is_number());
    assert!(body["process"]["memory_bytes"].is_number());
}
