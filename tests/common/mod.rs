//! Shared test infrastructure for integration tests.
//!
//! Provides throwaway HTTP backends, configuration builders and a gateway
//! constructor used across all integration test modules.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use strangler_gateway::config::{
    HashOnConfig, PassiveHealthConfig, RouteConfig, StranglerConfig, TargetConfig, UpstreamConfig,
};
use strangler_gateway::{
    BoxBody, Config, Gateway, GatewayRouter, HealthTracker, RouteMatcher, TargetRegistry,
    build_client,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A synthetic client address used in all test invocations.
const TEST_CLIENT_ADDR: &str = "192.168.1.100:54321";

/// Initializes a tracing subscriber for test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

pub fn test_addr() -> SocketAddr {
    TEST_CLIENT_ADDR.parse().unwrap()
}

/// Collects a [`BoxBody`] into [`Bytes`], mapping any body error to a
/// descriptive panic so test assertions remain concise.
pub async fn collect_body(body: BoxBody) -> Bytes {
    body.collect()
        .await
        .expect("failed to collect response body")
        .to_bytes()
}

pub fn empty_request(method: Method, path: &str) -> Request<Empty<Bytes>> {
    Request::builder()
        .method(method)
        .uri(path)
        .header("host", "gateway.local")
        .body(Empty::new())
        .unwrap()
}

pub fn json_request(method: Method, path: &str, json: &'static str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(method)
        .uri(path)
        .header("host", "gateway.local")
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(json)))
        .unwrap()
}

/// An upstream whose targets all carry the default weight.
pub fn upstream(id: &str, targets: &[SocketAddr]) -> UpstreamConfig {
    UpstreamConfig {
        id: id.into(),
        hash_on: HashOnConfig::None,
        hash_on_header: None,
        targets: targets
            .iter()
            .map(|addr| TargetConfig {
                address: addr.to_string(),
                weight: 100,
            })
            .collect(),
        strangler: None,
    }
}

/// A two-target legacy/modern upstream driven by `legacy_percent`.
pub fn strangler_upstream(
    id: &str,
    legacy: SocketAddr,
    modern: SocketAddr,
    legacy_percent: u32,
) -> UpstreamConfig {
    UpstreamConfig {
        strangler: Some(StranglerConfig { legacy_percent }),
        ..upstream(id, &[legacy, modern])
    }
}

pub fn route(name: &str, path: &str, upstream: &str) -> RouteConfig {
    RouteConfig {
        name: name.into(),
        path: path.into(),
        methods: vec!["GET".into(), "POST".into(), "PUT".into()],
        upstream: upstream.into(),
        strip_path: false,
        preserve_host: false,
    }
}

/// A config with the given upstreams and routes and otherwise defaults.
pub fn test_config(upstreams: Vec<UpstreamConfig>, routes: Vec<RouteConfig>) -> Config {
    Config {
        upstreams,
        routes,
        ..Default::default()
    }
}

pub fn with_thresholds(mut config: Config, unhealthy_after: u32, healthy_after: u32) -> Config {
    config.passive = Some(PassiveHealthConfig {
        unhealthy_after: Some(unhealthy_after),
        healthy_after: Some(healthy_after),
    });
    config
}

/// Builds a [`Gateway`] the way the binary does, without listeners.
pub fn build_gateway(config: Config) -> Arc<Gateway> {
    let config = Arc::new(config.into_runtime().expect("test config must be valid"));
    let registry = Arc::new(
        TargetRegistry::from_upstreams(config.upstreams.clone())
            .expect("test upstreams must be valid"),
    );
    let router = Arc::new(
        GatewayRouter::new(
            RouteMatcher::new(config.routes.clone()),
            Arc::clone(&registry),
        )
        .expect("test routes must be valid"),
    );
    let health = HealthTracker::new(registry, config.thresholds);
    let client = build_client(&config);
    Arc::new(Gateway::new(router, health, client, config))
}

/// Returns an address nothing listens on.
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind probe socket");
    listener.local_addr().unwrap()
}

/// Starts a local HTTP server that responds to every request with the given
/// status, content-type, and body. Returns the server address and a handle
/// to shut it down.
pub async fn start_backend(
    status: StatusCode,
    content_type: &'static str,
    body: &'static str,
) -> (SocketAddr, oneshot::Sender<()>) {
    start_backend_on(SocketAddr::from(([127, 0, 0, 1], 0)), status, content_type, body).await
}

/// [`start_backend`] on a fixed address, e.g. one a previous backend left.
pub async fn start_backend_on(
    addr: SocketAddr,
    status: StatusCode,
    content_type: &'static str,
    body: &'static str,
) -> (SocketAddr, oneshot::Sender<()>) {
    serve_backend_on(addr, move |_req| async move {
        Response::builder()
            .status(status)
            .header("content-type", content_type)
            .header("server", "Werkzeug/3.0")
            .body(Full::new(Bytes::from(body)))
            .expect("test response must build")
    })
    .await
}

/// Starts a backend that echoes the request line and sorted headers as the
/// response body. The first line is `METHOD path?query`.
pub async fn start_echo_backend() -> (SocketAddr, oneshot::Sender<()>) {
    serve_backend(|req| async move {
        let mut lines = Vec::new();
        for (name, value) in req.headers() {
            if let Ok(v) = value.to_str() {
                lines.push(format!("{}: {}", name.as_str(), v));
            }
        }
        lines.sort();
        let request_line = format!(
            "{} {}",
            req.method(),
            req.uri().path_and_query().map_or("/", |pq| pq.as_str())
        );
        let body = std::iter::once(request_line)
            .chain(lines)
            .collect::<Vec<_>>()
            .join("\n");
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain")
            .body(Full::new(Bytes::from(body)))
            .expect("test response must build")
    })
    .await
}

/// Starts a backend that sleeps for the given duration before responding.
pub async fn start_slow_backend(delay: Duration) -> (SocketAddr, oneshot::Sender<()>) {
    serve_backend(move |_req| async move {
        tokio::time::sleep(delay).await;
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain")
            .body(Full::new(Bytes::from("slow")))
            .expect("test response must build")
    })
    .await
}

/// Starts a backend that answers every request through `handler`.
pub async fn serve_backend<F, Fut>(handler: F) -> (SocketAddr, oneshot::Sender<()>)
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    serve_backend_on(SocketAddr::from(([127, 0, 0, 1], 0)), handler).await
}

pub async fn serve_backend_on<F, Fut>(addr: SocketAddr, handler: F) -> (SocketAddr, oneshot::Sender<()>)
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result.expect("accept failed");
                    let handler = handler.clone();
                    let service = service_fn(move |req: Request<Incoming>| {
                        let handler = handler.clone();
                        async move { Ok::<_, std::convert::Infallible>(handler(req).await) }
                    });
                    tokio::spawn(async move {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}
