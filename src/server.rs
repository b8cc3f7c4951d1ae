//! Accept loop, in-flight bound and process signals.
//!
//! Kept apart from `main()` so serving stays testable without signal
//! handling or `std::process::exit`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::proxy::{Gateway, handle_request};
use crate::{BoxBody, GatewayError};

/// What the accept loop hands to every connection.
#[derive(Debug, Clone)]
pub struct ServerState {
    pub gateway: Arc<Gateway>,
    /// One permit per in-flight request, shared by all connections.
    pub permits: Arc<Semaphore>,
    pub max_in_flight: usize,
}

impl ServerState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        let max_in_flight = gateway.config().max_concurrent_requests;
        Self {
            gateway,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
        }
    }

    /// Runs one request through the gateway, or rejects it with 503 when
    /// every permit is taken.
    async fn dispatch(self, req: Request<Incoming>, client_addr: SocketAddr) -> Response<BoxBody> {
        let Ok(_permit) = self.permits.try_acquire() else {
            warn!(limit = self.max_in_flight, "in-flight limit reached, shedding request");
            return GatewayError::ServiceUnavailable {
                limit: self.max_in_flight,
            }
            .into_response();
        };

        handle_request(req, self.gateway, client_addr)
            .await
            .unwrap_or_else(GatewayError::into_response)
    }
}

/// Accepts connections on `listener` until `shutdown` resolves.
///
/// Connections already accepted keep their tasks and finish their in-flight
/// requests.
pub async fn serve(listener: TcpListener, state: ServerState, shutdown: impl Future<Output = ()>) {
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, client_addr)) => {
                    tokio::spawn(serve_connection(stream, client_addr, state.clone()));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            () = &mut shutdown => {
                info!("stopped accepting connections");
                break;
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, client_addr: SocketAddr, state: ServerState) {
    let svc = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(state.dispatch(req, client_addr).await) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), svc)
        .await
    {
        debug!(error = %e, client = %client_addr, "connection closed with error");
    }
}

/// Resolves on SIGINT or SIGTERM (Ctrl+C elsewhere).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                let name = tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = sigterm.recv() => "SIGTERM",
                };
                info!(signal = name, "shutting down");
                return;
            }
            Err(e) => warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl+C only"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Ctrl+C handler unavailable");
        std::future::pending::<()>().await;
    }
    info!(signal = "Ctrl+C", "shutting down");
}
