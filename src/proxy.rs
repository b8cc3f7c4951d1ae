//! Request pipeline: routing, forwarding, single retry and error mapping.
//!
//! Every inbound request is assigned a monotonically increasing request ID
//! and wrapped in a [`tracing::Span`] carrying structured fields.
//!
//! The request body is buffered (bounded by `max_body_size`) so that a failed
//! attempt can be replayed once on a different target of the same upstream.
//! Only transport errors and timeouts count as forwarding failures; any HTTP
//! response from a target, including 5xx, is returned to the client as is.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;
use tracing::{Instrument, debug, info, warn};

use crate::error::full_body;
use crate::health::HealthTracker;
use crate::router::{ForwardInstruction, GatewayRouter};
use crate::{GatewayError, Result, RuntimeConfig, headers};

/// An alias to simplify the calls to `Box<dyn std::error::Error + Send + Sync>`.
pub(crate) type StdError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased body used for forwarded requests and returned responses.
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, StdError>;

/// The HTTP client used to reach targets.
pub type HttpClient = Client<HttpConnector, BoxBody>;

/// Attempts per request: the first target plus one retry elsewhere.
const MAX_ATTEMPTS: usize = 2;

/// Global monotonic counter for assigning unique request IDs.
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Constructs the pooled client used for forwarding.
pub fn build_client(config: &RuntimeConfig) -> HttpClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(config.connect_timeout));
    connector.set_nodelay(true);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(config.pool_idle_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .build(connector)
}

/// Shared per-process state of the forwarding pipeline.
#[derive(Debug)]
pub struct Gateway {
    router: Arc<GatewayRouter>,
    health: HealthTracker,
    client: HttpClient,
    config: Arc<RuntimeConfig>,
}

impl Gateway {
    pub fn new(
        router: Arc<GatewayRouter>,
        health: HealthTracker,
        client: HttpClient,
        config: Arc<RuntimeConfig>,
    ) -> Self {
        Self {
            router,
            health,
            client,
            config,
        }
    }

    pub fn router(&self) -> &Arc<GatewayRouter> {
        &self.router
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn config(&self) -> &Arc<RuntimeConfig> {
        &self.config
    }
}

/// Why a single forwarding attempt failed.
enum AttemptError {
    Timeout,
    Transport(hyper_util::client::legacy::Error),
}

/// Processes a single inbound request.
///
/// 1. Rejects request smuggling and declared bodies above `max_body_size`.
/// 2. Routes the request to a target ([`GatewayRouter::route`]).
/// 3. Buffers the body through a size limit.
/// 4. Forwards with the per-attempt timeout. A transport error or timeout is
///    reported to the health tracker and retried once on a different target.
/// 5. Reports success, strips hop-by-hop and configured response headers.
///
/// If every attempt timed out the result is [`GatewayError::GatewayTimeout`],
/// otherwise [`GatewayError::BackendUnavailable`].
pub async fn handle_request<B>(
    req: Request<B>,
    gateway: Arc<Gateway>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody>>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError>,
{
    let request_id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    let span = tracing::info_span!(
        "request",
        id = request_id,
        method = %req.method(),
        uri = %req.uri(),
        client = %client_addr,
    );

    async move {
        let config = &gateway.config;

        if headers::is_smuggling_attempt(req.headers()) {
            warn!("request smuggling attempt detected");
            return Err(GatewayError::RequestSmuggling);
        }

        if headers::content_length_exceeds(req.headers(), config.max_body_size) {
            warn!(limit = config.max_body_size, "request body exceeds size limit");
            return Err(GatewayError::BodyTooLarge {
                limit: config.max_body_size,
            });
        }

        let mut instruction = gateway.router.route(&req, client_addr)?;
        info!(
            route = %instruction.route.name,
            upstream = %instruction.upstream,
            target = %instruction.target.address,
            "routing request"
        );

        let body = read_body(req.into_body(), config.max_body_size).await?;

        let mut tried = Vec::with_capacity(MAX_ATTEMPTS);
        let mut all_timed_out = true;
        let mut last_error = String::new();

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                match gateway.router.retarget(&instruction, &tried) {
                    Ok(next) => {
                        info!(target = %next.target.address, "retrying on another target");
                        instruction = next;
                    }
                    Err(e) => {
                        debug!(error = %e, "no alternative target for retry");
                        break;
                    }
                }
            }
            tried.push(instruction.target.address.clone());

            let start = Instant::now();
            match forward(&gateway, &instruction, body.clone()).await? {
                Ok(resp) => {
                    gateway.health.record_success(&instruction.target.address);
                    info!(
                        status = resp.status().as_u16(),
                        latency_ms = start.elapsed().as_millis() as u64,
                        target = %instruction.target.address,
                        "target responded"
                    );
                    return Ok(finish_response(resp, config));
                }
                Err(AttemptError::Timeout) => {
                    let marked_unhealthy =
                        gateway.health.record_failure(&instruction.target.address);
                    warn!(
                        timeout = ?config.request_timeout,
                        target = %instruction.target.address,
                        marked_unhealthy,
                        "target timed out"
                    );
                    last_error = format!("timed out after {:?}", config.request_timeout);
                }
                Err(AttemptError::Transport(e)) => {
                    all_timed_out = false;
                    let marked_unhealthy =
                        gateway.health.record_failure(&instruction.target.address);
                    warn!(
                        error = %e,
                        latency_ms = start.elapsed().as_millis() as u64,
                        target = %instruction.target.address,
                        marked_unhealthy,
                        "forwarding failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        if all_timed_out {
            Err(GatewayError::GatewayTimeout {
                upstream: instruction.upstream,
                timeout: config.request_timeout,
            })
        } else {
            Err(GatewayError::BackendUnavailable {
                upstream: instruction.upstream,
                reason: last_error,
            })
        }
    }
    .instrument(span)
    .await
}

/// Buffers the request body, failing with 413 once `limit` bytes are exceeded.
async fn read_body<B>(body: B, limit: u64) -> Result<Bytes>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError>,
{
    let limit_usize = usize::try_from(limit).unwrap_or(usize::MAX);
    match Limited::new(body, limit_usize).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<http_body_util::LengthLimitError>() => {
            warn!(limit, "request body exceeds size limit");
            Err(GatewayError::BodyTooLarge { limit })
        }
        Err(e) => Err(GatewayError::Internal(format!(
            "failed to read request body: {e}"
        ))),
    }
}

/// Sends one attempt. The outer `Result` carries request construction errors,
/// which are not the target's fault.
async fn forward(
    gateway: &Gateway,
    instruction: &ForwardInstruction,
    body: Bytes,
) -> Result<std::result::Result<Response<Incoming>, AttemptError>> {
    let mut outbound = Request::builder()
        .method(instruction.method.clone())
        .uri(instruction.uri()?)
        .body(full_body(body))?;
    *outbound.headers_mut() = instruction.headers.clone();

    debug!(uri = %outbound.uri(), headers = ?outbound.headers(), "forwarding request");

    let result = timeout(
        gateway.config.request_timeout,
        gateway.client.request(outbound),
    )
    .await;

    Ok(match result {
        Ok(Ok(resp)) => Ok(resp),
        Ok(Err(e)) => Err(AttemptError::Transport(e)),
        Err(_elapsed) => Err(AttemptError::Timeout),
    })
}

fn finish_response(resp: Response<Incoming>, config: &RuntimeConfig) -> Response<BoxBody> {
    let (mut parts, body) = resp.into_parts();
    headers::strip_hop_by_hop(&mut parts.headers);
    headers::strip_response_headers(&mut parts.headers, &config.strip_response_headers);
    Response::from_parts(parts, body.map_err(|e| -> StdError { Box::new(e) }).boxed())
}
