//! Error types and HTTP status code mapping.
//!
//! Routing and forwarding failures are recovered at the gateway boundary and
//! turned into JSON error responses. Publish failures never reach a client;
//! they surface through the publisher's degraded-mode signal instead.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{ALLOW, CONTENT_TYPE, HeaderValue};
use hyper::{Method, Response, StatusCode};

use crate::BoxBody;

/// Every failure the gateway can produce, each mapping to a specific HTTP status.
#[derive(Debug)]
pub enum GatewayError {
    /// No configured route matches the request path.
    NoRoute { method: Method, path: String },
    /// A route matches the path but does not allow the request method.
    MethodNotAllowed { path: String, allowed: Vec<Method> },
    /// Every target of the upstream is unhealthy or drained.
    NoHealthyTarget { upstream: String },
    /// Forwarding failed on every attempted target.
    BackendUnavailable { upstream: String, reason: String },
    /// Every forwarding attempt exceeded the per-request timeout.
    GatewayTimeout { upstream: String, timeout: Duration },
    /// A registry lookup referenced an unknown upstream or target.
    NotFound { kind: &'static str, key: String },
    /// A queue message could not be published after all retries.
    Publish {
        queue: String,
        attempts: u32,
        reason: String,
    },
    /// The configuration file could not be loaded, parsed or validated.
    Config(String),
    /// The request carried both `Content-Length` and `Transfer-Encoding`.
    RequestSmuggling,
    /// The request body exceeds the configured limit.
    BodyTooLarge { limit: u64 },
    /// The in-flight request limit has been reached.
    ServiceUnavailable { limit: usize },
    /// An internal error that does not fit other categories.
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRoute { method, path } => write!(f, "no route for {method} {path}"),
            Self::MethodNotAllowed { path, allowed } => {
                let allowed = allowed
                    .iter()
                    .map(Method::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "method not allowed on {path} (allowed: {allowed})")
            }
            Self::NoHealthyTarget { upstream } => {
                write!(f, "no healthy target in upstream {upstream}")
            }
            Self::BackendUnavailable { upstream, reason } => {
                write!(f, "upstream {upstream} unavailable: {reason}")
            }
            Self::GatewayTimeout { upstream, timeout } => {
                write!(f, "upstream {upstream} timed out after {timeout:?}")
            }
            Self::NotFound { kind, key } => write!(f, "{kind} not found: {key}"),
            Self::Publish {
                queue,
                attempts,
                reason,
            } => write!(
                f,
                "failed to publish to {queue} after {attempts} attempts: {reason}"
            ),
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::RequestSmuggling => {
                write!(f, "both Content-Length and Transfer-Encoding present")
            }
            Self::BodyTooLarge { limit } => write!(f, "request body exceeds {limit} bytes"),
            Self::ServiceUnavailable { limit } => {
                write!(f, "concurrency limit of {limit} in-flight requests reached")
            }
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    /// Returns the HTTP status code corresponding to this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoRoute { .. } => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::NoHealthyTarget { .. }
            | Self::BackendUnavailable { .. }
            | Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::GatewayTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::RequestSmuggling => StatusCode::BAD_REQUEST,
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotFound { .. } | Self::Publish { .. } | Self::Config(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short machine-readable code used in the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoRoute { .. } => "no_route",
            Self::MethodNotAllowed { .. } => "method_not_allowed",
            Self::NoHealthyTarget { .. } => "no_healthy_target",
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::GatewayTimeout { .. } => "gateway_timeout",
            Self::NotFound { .. } => "not_found",
            Self::Publish { .. } => "publish_error",
            Self::Config(_) => "config_error",
            Self::RequestSmuggling => "request_smuggling",
            Self::BodyTooLarge { .. } => "body_too_large",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Converts this error into an HTTP response with a JSON body.
    pub fn into_response(self) -> Response<BoxBody> {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        });

        let mut builder = Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json");

        if let Self::MethodNotAllowed { allowed, .. } = &self {
            let allow = allowed
                .iter()
                .map(Method::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            if let Ok(value) = HeaderValue::from_str(&allow) {
                builder = builder.header(ALLOW, value);
            }
        }

        builder
            .body(full_body(Bytes::from(body.to_string())))
            .unwrap_or_else(|_| {
                let mut fallback = Response::new(full_body(Bytes::new()));
                *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                fallback
            })
    }
}

/// Wraps a fully buffered payload into the gateway's boxed body type.
pub(crate) fn full_body(bytes: Bytes) -> BoxBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

impl From<hyper::Error> for GatewayError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<hyper::http::Error> for GatewayError {
    fn from(err: hyper::http::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<hyper::header::InvalidHeaderValue> for GatewayError {
    fn from(err: hyper::header::InvalidHeaderValue) -> Self {
        Self::Internal(err.to_string())
    }
}
