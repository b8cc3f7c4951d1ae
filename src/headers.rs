//! HTTP header processing for forwarded requests and returned responses.
//!
//! Hop-by-hop headers (RFC 7230 Section 6.1) are removed in both directions.
//! Outbound requests carry the `X-Forwarded-*` convention plus
//! `X-Forwarded-Prefix` when a route stripped its matched prefix.

use std::net::SocketAddr;

use hyper::header::{HOST, HeaderMap, HeaderName, HeaderValue};
use hyper::http::uri::Authority;

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Removes the standard hop-by-hop headers plus any header named in the
/// `Connection` value.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let declared: Vec<HeaderName> = headers
        .get_all("connection")
        .iter()
        .filter_map(|val| val.to_str().ok())
        .flat_map(|val| val.split(','))
        .filter_map(|s| HeaderName::from_bytes(s.trim().as_bytes()).ok())
        .collect();

    for name in &declared {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Injects `X-Forwarded-For`, `X-Forwarded-Proto` and `X-Forwarded-Host`.
///
/// `X-Forwarded-For` is appended to any existing chain. `X-Forwarded-Host`
/// carries the client's original `Host`, so call this before the host is
/// rewritten.
pub fn inject_forwarding_headers(headers: &mut HeaderMap, client_addr: SocketAddr) {
    let client_ip = client_addr.ip().to_string();

    let xff_value = headers
        .get("x-forwarded-for")
        .and_then(|existing| existing.to_str().ok())
        .map(|existing| format!("{existing}, {client_ip}"))
        .unwrap_or(client_ip);

    if let Ok(val) = HeaderValue::from_str(&xff_value) {
        headers.insert("x-forwarded-for", val);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    if let Some(host) = headers.get(HOST).cloned() {
        headers.insert("x-forwarded-host", host);
    }
}

/// Sets `X-Forwarded-Prefix` to the path prefix a route removed.
pub fn inject_forwarded_prefix(headers: &mut HeaderMap, prefix: &str) {
    if prefix.is_empty() {
        return;
    }
    if let Ok(val) = HeaderValue::from_str(prefix) {
        headers.insert("x-forwarded-prefix", val);
    }
}

/// Applies the route's host policy.
///
/// With `preserve_host` the client's `Host` is kept (and filled in from the
/// target if the client sent none); otherwise it becomes the target authority.
pub fn apply_host(headers: &mut HeaderMap, target: &Authority, preserve_host: bool) {
    if preserve_host && headers.contains_key(HOST) {
        return;
    }
    if let Ok(val) = HeaderValue::from_str(target.as_str()) {
        headers.insert(HOST, val);
    }
}

/// Removes configured internal headers from a backend response.
pub fn strip_response_headers(headers: &mut HeaderMap, names: &[HeaderName]) {
    for name in names {
        headers.remove(name);
    }
}

/// Returns `true` if the request carries both `Content-Length` and
/// `Transfer-Encoding` (RFC 7230 Section 3.3.3).
pub fn is_smuggling_attempt(headers: &HeaderMap) -> bool {
    headers.contains_key(hyper::header::CONTENT_LENGTH)
        && headers.contains_key(hyper::header::TRANSFER_ENCODING)
}

/// Returns `true` if a declared `Content-Length` exceeds `max_bytes`.
///
/// Missing or unparseable values return `false`; hyper rejects malformed
/// lengths itself and the body is still read through a size limit.
pub fn content_length_exceeds(headers: &HeaderMap, max_bytes: u64) -> bool {
    headers
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|val| val.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .is_some_and(|len| len > max_bytes)
}
