//! Integration tests for routing, splitting and failover.
//!
//! Drives the full request pipeline against throwaway local backends:
//! legacy/modern weight splits, verbatim forwarding of parameterized paths,
//! prefix stripping, retries on a second target, 503/504 mapping, passive
//! health transitions and operator health overrides.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use http_body_util::Full;
use hyper::header::ALLOW;
use hyper::http::uri::Authority;
use hyper::{Method, Request, StatusCode};
use strangler_gateway::{
    AdminState, Gateway, GatewayError, HealthStatus, handle_admin, handle_request,
};

fn authority(addr: std::net::SocketAddr) -> Authority {
    addr.to_string().parse().unwrap()
}

async fn send_get(gateway: &Arc<Gateway>, path: &str) -> Result<(StatusCode, Bytes), GatewayError> {
    let resp = handle_request(
        empty_request(Method::GET, path),
        Arc::clone(gateway),
        test_addr(),
    )
    .await?;
    let status = resp.status();
    Ok((status, collect_body(resp.into_body()).await))
}

#[tokio::test]
async fn strangler_split_follows_legacy_percent() {
    init_tracing();
    let (legacy, _l) = start_backend(StatusCode::OK, "text/plain", "legacy").await;
    let (modern, _m) = start_backend(StatusCode::OK, "text/plain", "modern").await;

    let gateway = build_gateway(test_config(
        vec![strangler_upstream("user_service_upstream", legacy, modern, 70)],
        vec![route("user_by_id", "/users/{user_id}", "user_service_upstream")],
    ));

    let total = 1_000;
    let mut legacy_hits = 0;
    for i in 0..total {
        let (status, body) = send_get(&gateway, &format!("/users/u-{i}")).await.unwrap();
        assert_eq!(status, StatusCode::OK);
        if body == Bytes::from("legacy") {
            legacy_hits += 1;
        }
    }

    let ratio = f64::from(legacy_hits) / f64::from(total);
    assert!((0.64..=0.76).contains(&ratio), "legacy ratio {ratio}");
}

#[tokio::test]
async fn completed_migration_sends_everything_to_modern() {
    init_tracing();
    let (legacy, _l) = start_backend(StatusCode::OK, "text/plain", "legacy").await;
    let (modern, _m) = start_backend(StatusCode::OK, "text/plain", "modern").await;

    let gateway = build_gateway(test_config(
        vec![strangler_upstream("user_service_upstream", legacy, modern, 0)],
        vec![route("users", "/users/", "user_service_upstream")],
    ));

    for _ in 0..50 {
        let (_, body) = send_get(&gateway, "/users").await.unwrap();
        assert_eq!(body, Bytes::from("modern"));
    }
}

#[tokio::test]
async fn order_action_forwarded_verbatim_with_params() {
    init_tracing();
    let (orders, _o) = start_echo_backend().await;

    let gateway = build_gateway(test_config(
        vec![upstream("order_service_upstream", &[orders])],
        vec![
            route("orders", "/orders", "order_service_upstream"),
            route(
                "order_actions",
                "/orders/{order_id}/{action:status|details}",
                "order_service_upstream",
            ),
        ],
    ));

    let req = empty_request(Method::GET, "/orders/abc-123/status?verbose=1");
    let instruction = gateway.router().route(&req, test_addr()).unwrap();
    assert_eq!(instruction.route.name, "order_actions");
    assert_eq!(instruction.params["order_id"], "abc-123");
    assert_eq!(instruction.params["action"], "status");

    let (status, body) = send_get(&gateway, "/orders/abc-123/status?verbose=1")
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK);

    let body = String::from_utf8(body.to_vec()).unwrap();
    assert_eq!(body.lines().next(), Some("GET /orders/abc-123/status?verbose=1"));
    assert!(body.contains("x-forwarded-for: 192.168.1.100"), "{body}");
    assert!(body.contains("x-forwarded-host: gateway.local"), "{body}");
    assert!(body.contains(&format!("host: {orders}")), "{body}");
    assert!(!body.contains("x-forwarded-prefix"), "{body}");
}

#[tokio::test]
async fn strip_path_removes_prefix_and_preserve_host_keeps_client_host() {
    init_tracing();
    let (backend, _b) = start_echo_backend().await;

    let mut legacy_api = route("legacy_api", "~/legacy", "users");
    legacy_api.strip_path = true;
    legacy_api.preserve_host = true;

    let gateway = build_gateway(test_config(
        vec![upstream("users", &[backend])],
        vec![legacy_api],
    ));

    let (_, body) = send_get(&gateway, "/legacy/users/42?fields=email").await.unwrap();
    let body = String::from_utf8(body.to_vec()).unwrap();

    assert_eq!(body.lines().next(), Some("GET /users/42?fields=email"));
    assert!(body.contains("x-forwarded-prefix: /legacy"), "{body}");
    assert!(body.contains("host: gateway.local"), "{body}");
}

#[tokio::test]
async fn unknown_path_and_disallowed_method() {
    init_tracing();
    let (orders, _o) = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let gateway = build_gateway(test_config(
        vec![upstream("order_service_upstream", &[orders])],
        vec![route("orders", "/orders", "order_service_upstream")],
    ));

    let err = send_get(&gateway, "/inventory").await.unwrap_err();
    assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

    let err = handle_request(
        empty_request(Method::DELETE, "/orders"),
        Arc::clone(&gateway),
        test_addr(),
    )
    .await
    .unwrap_err();
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(resp.headers()[ALLOW], "GET, POST, PUT");
}

#[tokio::test]
async fn post_body_reaches_backend_and_status_passes_through() {
    init_tracing();
    let (orders, _o) =
        start_backend(StatusCode::CREATED, "application/json", r#"{"orderId":"abc-123"}"#).await;
    let gateway = build_gateway(test_config(
        vec![upstream("order_service_upstream", &[orders])],
        vec![route("orders", "/orders", "order_service_upstream")],
    ));

    let resp = handle_request(
        json_request(Method::POST, "/orders", r#"{"userId":"u-1","items":[]}"#),
        Arc::clone(&gateway),
        test_addr(),
    )
    .await
    .unwrap();

    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = collect_body(resp.into_body()).await;
    assert_eq!(body, Bytes::from(r#"{"orderId":"abc-123"}"#));
}

#[tokio::test]
async fn failed_target_is_retried_on_another() {
    init_tracing();
    let dead = closed_addr().await;
    let (live, _l) = start_backend(StatusCode::OK, "text/plain", "live").await;

    let gateway = build_gateway(test_config(
        vec![upstream("order_service_upstream", &[dead, live])],
        vec![route("orders", "/orders", "order_service_upstream")],
    ));

    for _ in 0..20 {
        let (status, body) = send_get(&gateway, "/orders").await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from("live"));
    }

    // Enough failures landed on the dead target to take it out of rotation.
    let registry = gateway.router().registry();
    assert_eq!(registry.health_of(&authority(dead)), Some(HealthStatus::Unhealthy));
    assert_eq!(registry.health_of(&authority(live)), Some(HealthStatus::Healthy));
}

#[tokio::test]
async fn all_targets_refusing_is_503() {
    init_tracing();
    let first = closed_addr().await;
    let second = closed_addr().await;

    let gateway = build_gateway(test_config(
        vec![upstream("order_service_upstream", &[first, second])],
        vec![route("orders", "/orders", "order_service_upstream")],
    ));

    let err = send_get(&gateway, "/orders").await.unwrap_err();
    assert!(matches!(err, GatewayError::BackendUnavailable { .. }), "{err}");
    assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn timed_out_attempts_are_504() {
    init_tracing();
    let (slow_a, _a) = start_slow_backend(Duration::from_millis(500)).await;
    let (slow_b, _b) = start_slow_backend(Duration::from_millis(500)).await;

    let mut config = test_config(
        vec![upstream("order_service_upstream", &[slow_a, slow_b])],
        vec![route("orders", "/orders", "order_service_upstream")],
    );
    config.request_timeout_ms = Some(100);
    let gateway = build_gateway(config);

    let err = send_get(&gateway, "/orders").await.unwrap_err();
    assert!(matches!(err, GatewayError::GatewayTimeout { .. }), "{err}");
    assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn passive_checks_flip_after_exactly_n_failures() {
    init_tracing();
    let dead = closed_addr().await;

    let gateway = build_gateway(with_thresholds(
        test_config(
            vec![upstream("order_service_upstream", &[dead])],
            vec![route("orders", "/orders", "order_service_upstream")],
        ),
        3,
        2,
    ));
    let registry = gateway.router().registry();

    for _ in 0..2 {
        let err = send_get(&gateway, "/orders").await.unwrap_err();
        assert!(matches!(err, GatewayError::BackendUnavailable { .. }));
    }
    assert_ne!(registry.health_of(&authority(dead)), Some(HealthStatus::Unhealthy));

    send_get(&gateway, "/orders").await.unwrap_err();
    assert_eq!(registry.health_of(&authority(dead)), Some(HealthStatus::Unhealthy));

    let err = send_get(&gateway, "/orders").await.unwrap_err();
    assert!(matches!(err, GatewayError::NoHealthyTarget { .. }), "{err}");
    assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn operator_returns_a_restarted_target_to_rotation() {
    init_tracing();
    let dead = closed_addr().await;

    let gateway = build_gateway(with_thresholds(
        test_config(
            vec![upstream("order_service_upstream", &[dead])],
            vec![route("orders", "/orders", "order_service_upstream")],
        ),
        3,
        2,
    ));
    let registry = gateway.router().registry();
    for _ in 0..3 {
        send_get(&gateway, "/orders").await.unwrap_err();
    }
    assert_eq!(registry.health_of(&authority(dead)), Some(HealthStatus::Unhealthy));

    // The backend comes back on the same address; without probes nothing
    // notices on its own.
    let (_, _b) = start_backend_on(dead, StatusCode::OK, "text/plain", "back").await;
    let err = send_get(&gateway, "/orders").await.unwrap_err();
    assert!(matches!(err, GatewayError::NoHealthyTarget { .. }), "{err}");

    let admin = Arc::new(AdminState::new(
        gateway.health().clone(),
        gateway.config().splits.clone(),
        None,
    ));
    let req = Request::builder()
        .method(Method::PUT)
        .uri(format!("/upstreams/order_service_upstream/targets/{dead}/health"))
        .body(Full::new(Bytes::from(r#"{"status": "healthy"}"#)))
        .unwrap();
    assert_eq!(handle_admin(req, admin).await.status(), StatusCode::OK);

    let (status, body) = send_get(&gateway, "/orders").await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from("back"));
    assert_eq!(registry.health_of(&authority(dead)), Some(HealthStatus::Healthy));
}

#[tokio::test]
async fn oversized_body_is_rejected_before_forwarding() {
    init_tracing();
    let (orders, _o) = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let mut config = test_config(
        vec![upstream("order_service_upstream", &[orders])],
        vec![route("orders", "/orders", "order_service_upstream")],
    );
    config.max_body_size = Some(16);
    let gateway = build_gateway(config);

    let req = Request::builder()
        .method(Method::POST)
        .uri("/orders")
        .body(Full::new(Bytes::from(vec![b'x'; 64])))
        .unwrap();
    let err = handle_request(req, gateway, test_addr()).await.unwrap_err();
    assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn configured_response_headers_are_stripped() {
    init_tracing();
    let (orders, _o) = start_backend(StatusCode::OK, "text/plain", "ok").await;
    let mut config = test_config(
        vec![upstream("order_service_upstream", &[orders])],
        vec![route("orders", "/orders", "order_service_upstream")],
    );
    config.strip_response_headers = vec!["server".into()];
    let gateway = build_gateway(config);

    let resp = handle_request(
        empty_request(Method::GET, "/orders"),
        gateway,
        test_addr(),
    )
    .await
    .unwrap();
    assert!(resp.headers().get("server").is_none());
    assert_eq!(resp.headers()["content-type"], "text/plain");
}

#[tokio::test]
async fn admin_split_change_takes_effect_on_next_request() {
    init_tracing();
    let (legacy, _l) = start_backend(StatusCode::OK, "text/plain", "legacy").await;
    let (modern, _m) = start_backend(StatusCode::OK, "text/plain", "modern").await;

    let gateway = build_gateway(test_config(
        vec![strangler_upstream("user_service_upstream", legacy, modern, 50)],
        vec![route("user_by_id", "/users/{user_id}", "user_service_upstream")],
    ));
    let admin = Arc::new(AdminState::new(
        gateway.health().clone(),
        gateway.config().splits.clone(),
        None,
    ));

    let req = Request::builder()
        .method(Method::PUT)
        .uri("/upstreams/user_service_upstream/split")
        .body(Full::new(Bytes::from(r#"{"legacy_percent": 100}"#)))
        .unwrap();
    let resp = handle_admin(req, admin).await;
    assert_eq!(resp.status(), StatusCode::OK);

    for _ in 0..30 {
        let (_, body) = send_get(&gateway, "/users/u-1").await.unwrap();
        assert_eq!(body, Bytes::from("legacy"));
    }
}
