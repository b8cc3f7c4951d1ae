//! Control-plane HTTP API.
//!
//! - `GET /health`: liveness plus registry version and publisher backlog.
//! - `GET /upstreams`: every upstream with its targets, weights and health.
//! - `PUT /upstreams/{id}/targets/{address}/weight` with `{"weight": n}`.
//! - `PUT /upstreams/{id}/targets/{address}/health` with
//!   `{"status": "healthy" | "unhealthy" | "unknown"}`. This is how a target
//!   that passive checks took out comes back when active probes are off.
//! - `PUT /upstreams/{id}/split` with `{"legacy_percent": p}` for strangler
//!   upstreams.
//!
//! Weight and health changes take effect for the next routed request.

use std::convert::Infallible;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::http::uri::Authority;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::error::full_body;
use crate::health::HealthTracker;
use crate::proxy::StdError;
use crate::publisher::DegradedSignal;
use crate::registry::{HashOn, HealthStatus, TargetRegistry};
use crate::strangler::StranglerSplit;
use crate::{BoxBody, GatewayError};

const MAX_ADMIN_BODY: usize = 64 * 1024;

/// State shared by admin handlers.
#[derive(Debug)]
pub struct AdminState {
    registry: Arc<TargetRegistry>,
    health: HealthTracker,
    splits: ArcSwap<Vec<StranglerSplit>>,
    degraded: Option<Arc<DegradedSignal>>,
}

impl AdminState {
    pub fn new(
        health: HealthTracker,
        splits: Vec<StranglerSplit>,
        degraded: Option<Arc<DegradedSignal>>,
    ) -> Self {
        Self {
            registry: Arc::clone(health.registry()),
            health,
            splits: ArcSwap::from_pointee(splits),
            degraded,
        }
    }

    /// Replaces the known strangler splits after a reload.
    pub fn replace_splits(&self, splits: Vec<StranglerSplit>) {
        self.splits.store(Arc::new(splits));
    }
}

#[derive(Debug, Serialize)]
struct TargetView {
    address: String,
    weight: u32,
    health: &'static str,
}

#[derive(Debug, Serialize)]
struct UpstreamView {
    id: String,
    hash_on: String,
    total_weight: u64,
    targets: Vec<TargetView>,
}

#[derive(Debug, Deserialize)]
struct WeightUpdate {
    weight: u32,
}

#[derive(Debug, Deserialize)]
struct HealthUpdate {
    status: HealthOverride,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum HealthOverride {
    Healthy,
    Unhealthy,
    Unknown,
}

impl From<HealthOverride> for HealthStatus {
    fn from(status: HealthOverride) -> Self {
        match status {
            HealthOverride::Healthy => Self::Healthy,
            HealthOverride::Unhealthy => Self::Unhealthy,
            HealthOverride::Unknown => Self::Unknown,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SplitUpdate {
    legacy_percent: u32,
}

/// Routes one admin request.
pub async fn handle_admin<B>(req: Request<B>, state: Arc<AdminState>) -> Response<BoxBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let segments = path
        .trim_matches('/')
        .split('/')
        .collect::<Vec<&str>>();

    let result = match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => Ok(health(&state)),
        (&Method::GET, ["upstreams"]) => Ok(upstreams(&state)),
        (&Method::PUT, ["upstreams", id, "targets", address, "weight"]) => {
            update_weight(req, &state, id, address).await
        }
        (&Method::PUT, ["upstreams", id, "targets", address, "health"]) => {
            update_health(req, &state, id, address).await
        }
        (&Method::PUT, ["upstreams", id, "split"]) => update_split(req, &state, id).await,
        _ => Err(GatewayError::NoRoute {
            method: method.clone(),
            path: path.clone(),
        }),
    };

    result.unwrap_or_else(|e| {
        warn!(%method, %path, error = %e, "admin request failed");
        error_response(e)
    })
}

fn health(state: &AdminState) -> Response<BoxBody> {
    let (failed, pending) = state
        .degraded
        .as_ref()
        .map_or((0, 0), |d| (d.failed_count(), d.pending_len()));
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "status": "ok",
            "registry_version": state.registry.snapshot().version(),
            "publisher": {
                "degraded": pending > 0,
                "failed": failed,
                "pending": pending,
            },
        }),
    )
}

fn upstreams(state: &AdminState) -> Response<BoxBody> {
    let snapshot = state.registry.snapshot();
    let views = snapshot
        .upstreams()
        .map(|u| UpstreamView {
            id: u.id().to_owned(),
            hash_on: match u.hash_on() {
                HashOn::None => "none".to_owned(),
                HashOn::ClientIp => "client_ip".to_owned(),
                HashOn::Header(name) => format!("header:{name}"),
            },
            total_weight: u.total_weight(),
            targets: u
                .targets()
                .iter()
                .map(|t| TargetView {
                    address: t.address.to_string(),
                    weight: t.weight,
                    health: t.health.as_str(),
                })
                .collect(),
        })
        .collect::<Vec<_>>();
    json_response(StatusCode::OK, &views)
}

async fn update_weight<B>(
    req: Request<B>,
    state: &AdminState,
    upstream_id: &str,
    address: &str,
) -> crate::Result<Response<BoxBody>>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError>,
{
    let address = parse_address(address)?;
    let update: WeightUpdate = read_json(req).await?;

    state
        .registry
        .update_weight(upstream_id, &address, update.weight)?;
    info!(upstream = upstream_id, target = %address, weight = update.weight, "target weight updated");

    Ok(upstream_response(state, upstream_id))
}

async fn update_health<B>(
    req: Request<B>,
    state: &AdminState,
    upstream_id: &str,
    address: &str,
) -> crate::Result<Response<BoxBody>>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError>,
{
    let address = parse_address(address)?;
    let update: HealthUpdate = read_json(req).await?;

    // The health lives on the address, but the URL names an upstream too.
    if state.registry.get(upstream_id)?.target(&address).is_none() {
        return Err(GatewayError::NotFound {
            kind: "target",
            key: format!("{upstream_id}/{address}"),
        });
    }
    state.health.set_status(&address, update.status.into())?;

    Ok(upstream_response(state, upstream_id))
}

fn parse_address(address: &str) -> crate::Result<Authority> {
    address
        .parse::<Authority>()
        .map_err(|e| GatewayError::Config(format!("invalid target address {address}: {e}")))
}

async fn update_split<B>(
    req: Request<B>,
    state: &AdminState,
    upstream_id: &str,
) -> crate::Result<Response<BoxBody>>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError>,
{
    let update: SplitUpdate = read_json(req).await?;
    let splits = state.splits.load_full();
    let split = splits
        .iter()
        .find(|s| s.upstream() == upstream_id)
        .ok_or_else(|| GatewayError::NotFound {
            kind: "strangler split",
            key: upstream_id.to_owned(),
        })?;

    split.apply(&state.registry, update.legacy_percent)?;
    Ok(upstream_response(state, upstream_id))
}

fn upstream_response(state: &AdminState, upstream_id: &str) -> Response<BoxBody> {
    match state.registry.get(upstream_id) {
        Ok(upstream) => json_response(
            StatusCode::OK,
            &upstream
                .targets()
                .iter()
                .map(|t| TargetView {
                    address: t.address.to_string(),
                    weight: t.weight,
                    health: t.health.as_str(),
                })
                .collect::<Vec<_>>(),
        ),
        Err(e) => error_response(e),
    }
}

async fn read_json<B, T>(req: Request<B>) -> crate::Result<T>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError>,
    T: for<'de> Deserialize<'de>,
{
    let bytes = Limited::new(req.into_body(), MAX_ADMIN_BODY)
        .collect()
        .await
        .map_err(|e| GatewayError::Config(format!("failed to read body: {e}")))?
        .to_bytes();
    serde_json::from_slice(&bytes)
        .map_err(|e| GatewayError::Config(format!("invalid JSON body: {e}")))
}

/// Admin callers get 404 for unknown ids and 400 for rejected input,
/// unlike the data plane where both indicate a server fault.
fn error_response(err: GatewayError) -> Response<BoxBody> {
    let status = match &err {
        GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
        GatewayError::Config(_) => StatusCode::BAD_REQUEST,
        other => other.status_code(),
    };
    let mut resp = err.into_response();
    *resp.status_mut() = status;
    resp
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<BoxBody> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    let mut resp = Response::new(full_body(Bytes::from(body)));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
    resp
}

/// Serves the admin API until `shutdown` resolves.
pub async fn serve_admin(
    listener: TcpListener,
    state: Arc<AdminState>,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(%e, "failed to accept admin connection");
                        continue;
                    }
                };

                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let svc = service_fn(move |req: Request<Incoming>| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, Infallible>(handle_admin(req, state).await) }
                    });
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await
                    {
                        warn!(%e, %peer, "admin connection error");
                    }
                });
            }
            () = &mut shutdown => {
                info!("admin listener shutting down");
                break;
            }
        }
    }
}
