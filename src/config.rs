//! Configuration loading, environment interpolation and validation.
//!
//! The gateway reads its YAML configuration once at startup (and again on
//! reload). Environment variables are captured once into an [`EnvSnapshot`],
//! so nothing reads the process environment afterwards. `${NAME}` and
//! `${NAME:-default}` placeholders are substituted inside string scalars of
//! the parsed YAML tree, never in the raw text, so a value is taken verbatim
//! whatever characters it contains. Numeric and boolean fields accept either
//! a YAML scalar or a string, which is what a substituted placeholder yields.
//! The parsed [`Config`] is validated into a [`RuntimeConfig`] holding
//! compiled routes and registry-ready upstreams.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use hyper::Method;
use hyper::header::HeaderName;
use hyper::http::uri::Authority;
use regex::{Captures, Regex};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;

use crate::amqp::AmqpSettings;
use crate::health::{HealthThresholds, ProbeSettings};
use crate::matcher::{PathPattern, Route};
use crate::publisher::RetryPolicy;
use crate::registry::{HashOn, Target, Upstream};
use crate::strangler::StranglerSplit;
use crate::{GatewayError, Result};

/// Default maximum request body size: 10 MiB.
pub const DEFAULT_MAX_BODY_SIZE: u64 = 10 * 1024 * 1024;

/// Default connect timeout for establishing target TCP connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-attempt forwarding timeout. Expiry counts as a passive failure.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default idle timeout for pooled target connections.
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default maximum number of idle connections kept per target.
pub const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 32;

/// Default maximum number of concurrent in-flight requests.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 1000;

/// Default weight of a target when none is specified.
pub const DEFAULT_TARGET_WEIGHT: u32 = 100;

/// Default socket address the gateway binds to.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8000";

/// Default consecutive forwarding failures before a target is marked unhealthy.
pub const DEFAULT_UNHEALTHY_AFTER: u32 = 3;

/// Default consecutive successes before an unhealthy target recovers.
pub const DEFAULT_HEALTHY_AFTER: u32 = 2;

/// Default interval between active health probes.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Default timeout of a single active health probe.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default path for active health probes.
pub const DEFAULT_HEALTH_CHECK_PATH: &str = "/health";

/// Default publish attempts before a message is handed to the degraded signal.
pub const DEFAULT_PUBLISH_ATTEMPTS: u32 = 3;

/// Default delay before the first publish retry; doubles per attempt.
pub const DEFAULT_PUBLISH_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Default upper bound of the publish backoff.
pub const DEFAULT_PUBLISH_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Default time a caller waits for a broker acknowledgment.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_millis(500);

/// Default number of undelivered messages kept for reconciliation.
pub const DEFAULT_PENDING_CAPACITY: usize = 1024;

/// Default AMQP port.
pub const DEFAULT_AMQP_PORT: u16 = 5672;

const PLACEHOLDER: &str = r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}";

/// Immutable copy of the process environment taken once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    /// Captures the current process environment.
    pub fn capture() -> Self {
        Self::from_pairs(std::env::vars())
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }
}

/// Substitutes `${NAME}` and `${NAME:-default}` placeholders in one string.
///
/// A variable that is unset and has no default is a configuration error. An
/// empty variable falls back to the default, as in POSIX shells.
pub fn interpolate(raw: &str, env: &EnvSnapshot) -> Result<String> {
    let placeholder = placeholder_pattern()?;
    let mut missing = Vec::new();
    let out = substitute(raw, env, &placeholder, &mut missing);
    missing_error(missing).map(|()| out)
}

/// Substitutes placeholders in every string scalar of a parsed YAML tree.
///
/// Mapping keys are left alone. Every missing variable in the tree is
/// reported at once.
pub fn interpolate_value(value: &mut Value, env: &EnvSnapshot) -> Result<()> {
    let placeholder = placeholder_pattern()?;
    let mut missing = Vec::new();
    substitute_tree(value, env, &placeholder, &mut missing);
    missing_error(missing)
}

fn placeholder_pattern() -> Result<Regex> {
    Regex::new(PLACEHOLDER)
        .map_err(|e| GatewayError::Internal(format!("placeholder pattern: {e}")))
}

fn substitute(
    raw: &str,
    env: &EnvSnapshot,
    placeholder: &Regex,
    missing: &mut Vec<String>,
) -> String {
    placeholder
        .replace_all(raw, |caps: &Captures<'_>| {
            let name = &caps[1];
            match (env.get(name), caps.get(2)) {
                (Some(value), Some(default)) if value.is_empty() => default.as_str().to_owned(),
                (Some(value), _) => value.to_owned(),
                (None, Some(default)) => default.as_str().to_owned(),
                (None, None) => {
                    if !missing.iter().any(|m| m == name) {
                        missing.push(name.to_owned());
                    }
                    String::new()
                }
            }
        })
        .into_owned()
}

fn substitute_tree(
    value: &mut Value,
    env: &EnvSnapshot,
    placeholder: &Regex,
    missing: &mut Vec<String>,
) {
    match value {
        Value::String(text) => {
            if placeholder.is_match(text) {
                *text = substitute(text, env, placeholder, missing);
            }
        }
        Value::Sequence(items) => {
            for item in items {
                substitute_tree(item, env, placeholder, missing);
            }
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                substitute_tree(item, env, placeholder, missing);
            }
        }
        Value::Tagged(tagged) => substitute_tree(&mut tagged.value, env, placeholder, missing),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

fn missing_error(missing: Vec<String>) -> Result<()> {
    if missing.is_empty() {
        Ok(())
    } else {
        Err(GatewayError::Config(format!(
            "environment variables not set: {}",
            missing.join(", ")
        )))
    }
}

/// Accepts a YAML scalar or its string form, as produced by `${...}`.
fn scalar<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + FromStr,
    T::Err: Display,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => text
            .trim()
            .parse()
            .map_err(|e| D::Error::custom(format!("invalid value \"{text}\": {e}"))),
        other => serde_yaml::from_value(other).map_err(D::Error::custom),
    }
}

/// [`scalar`] for optional fields; `null` and an empty string are absent.
fn optional_scalar<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + FromStr,
    T::Err: Display,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(text) if text.trim().is_empty() => Ok(None),
        other => scalar(other).map(Some).map_err(D::Error::custom),
    }
}

/// Raw configuration as deserialized from the YAML file.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Socket address of the gateway listener (default `"127.0.0.1:8000"`).
    #[serde(default)]
    pub listen: Option<String>,
    /// Socket address of the admin API. Absent disables the admin listener.
    #[serde(default)]
    pub admin_listen: Option<String>,
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// Maximum allowed request body size in bytes (default: 10 MiB).
    #[serde(default, deserialize_with = "optional_scalar")]
    pub max_body_size: Option<u64>,
    /// Response header names removed before returning to the client.
    #[serde(default)]
    pub strip_response_headers: Vec<String>,
    #[serde(default, deserialize_with = "optional_scalar")]
    pub connect_timeout_ms: Option<u64>,
    /// Per-attempt forwarding timeout in milliseconds (default: 30000).
    #[serde(default, deserialize_with = "optional_scalar")]
    pub request_timeout_ms: Option<u64>,
    #[serde(default, deserialize_with = "optional_scalar")]
    pub pool_idle_timeout_ms: Option<u64>,
    #[serde(default, deserialize_with = "optional_scalar")]
    pub pool_max_idle_per_host: Option<usize>,
    /// Maximum concurrent in-flight requests before 503 (default: 1000).
    #[serde(default, deserialize_with = "optional_scalar")]
    pub max_concurrent_requests: Option<usize>,
    /// Active health probes. Absent disables probing.
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default)]
    pub passive: Option<PassiveHealthConfig>,
    /// Message broker connection. Absent disables queue publishing.
    #[serde(default)]
    pub broker: Option<BrokerConfig>,
    #[serde(default)]
    pub publish: Option<PublishConfig>,
}

/// A named group of targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    pub id: String,
    #[serde(default)]
    pub hash_on: HashOnConfig,
    /// Header name hashed when `hash_on` is `header`.
    #[serde(default)]
    pub hash_on_header: Option<String>,
    pub targets: Vec<TargetConfig>,
    /// Drives the two target weights from a single legacy percentage.
    #[serde(default)]
    pub strangler: Option<StranglerConfig>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HashOnConfig {
    #[default]
    None,
    ClientIp,
    Header,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetConfig {
    /// `host:port` of the backend instance.
    pub address: String,
    #[serde(default = "default_weight", deserialize_with = "scalar")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    DEFAULT_TARGET_WEIGHT
}

/// Legacy/modern split of a two-target upstream.
///
/// The first target is the legacy implementation and receives
/// `legacy_percent`; the second receives the rest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StranglerConfig {
    #[serde(deserialize_with = "scalar")]
    pub legacy_percent: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteConfig {
    pub name: String,
    /// Literal path, `{param}` template, or `~`-prefixed regex.
    pub path: String,
    /// Allowed methods; empty allows any.
    #[serde(default)]
    pub methods: Vec<String>,
    pub upstream: String,
    #[serde(default, deserialize_with = "scalar")]
    pub strip_path: bool,
    #[serde(default, deserialize_with = "scalar")]
    pub preserve_host: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_health_interval_ms", deserialize_with = "scalar")]
    pub interval_ms: u64,
    #[serde(default = "default_health_timeout_ms", deserialize_with = "scalar")]
    pub timeout_ms: u64,
}

fn default_health_path() -> String {
    DEFAULT_HEALTH_CHECK_PATH.into()
}

fn default_health_interval_ms() -> u64 {
    DEFAULT_HEALTH_CHECK_INTERVAL.as_millis() as u64
}

fn default_health_timeout_ms() -> u64 {
    DEFAULT_HEALTH_CHECK_TIMEOUT.as_millis() as u64
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
        }
    }
}

/// Consecutive-outcome thresholds for passive health checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PassiveHealthConfig {
    #[serde(default, deserialize_with = "optional_scalar")]
    pub unhealthy_after: Option<u32>,
    #[serde(default, deserialize_with = "optional_scalar")]
    pub healthy_after: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    pub host: String,
    #[serde(default = "default_amqp_port", deserialize_with = "scalar")]
    pub port: u16,
    #[serde(default = "default_guest")]
    pub user: String,
    #[serde(default = "default_guest")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    /// Default queue (routing key) for domain events.
    pub queue: String,
}

fn default_amqp_port() -> u16 {
    DEFAULT_AMQP_PORT
}

fn default_guest() -> String {
    "guest".into()
}

fn default_vhost() -> String {
    "/".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PublishConfig {
    #[serde(default, deserialize_with = "optional_scalar")]
    pub attempts: Option<u32>,
    #[serde(default, deserialize_with = "optional_scalar")]
    pub initial_backoff_ms: Option<u64>,
    #[serde(default, deserialize_with = "optional_scalar")]
    pub max_backoff_ms: Option<u64>,
    #[serde(default, deserialize_with = "optional_scalar")]
    pub ack_wait_ms: Option<u64>,
    #[serde(default, deserialize_with = "optional_scalar")]
    pub pending_capacity: Option<usize>,
}

/// Publisher settings resolved from [`PublishConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishSettings {
    pub retry: RetryPolicy,
    pub ack_wait: Duration,
    pub pending_capacity: usize,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            ack_wait: DEFAULT_ACK_WAIT,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
        }
    }
}

/// Fully validated configuration, shared across handlers via `Arc`.
#[derive(Debug)]
pub struct RuntimeConfig {
    pub listen: SocketAddr,
    pub admin_listen: Option<SocketAddr>,
    /// Registry-ready upstreams; strangler weights already applied.
    pub upstreams: Vec<Upstream>,
    pub splits: Vec<StranglerSplit>,
    pub routes: Vec<Route>,
    pub max_body_size: u64,
    pub strip_response_headers: Vec<HeaderName>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub max_concurrent_requests: usize,
    /// Active probe settings. `None` disables active probing.
    pub health_check: Option<ProbeSettings>,
    pub thresholds: HealthThresholds,
    /// Broker connection. `None` disables queue publishing.
    pub broker: Option<AmqpSettings>,
    pub publish: PublishSettings,
}

impl Config {
    /// Loads configuration from a YAML file and interpolates `env`.
    pub fn load_from_file(
        file_path: &(impl AsRef<Path> + ?Sized),
        env: &EnvSnapshot,
    ) -> Result<Self> {
        let raw = std::fs::read_to_string(file_path).map_err(|e| {
            GatewayError::Config(format!(
                "failed to open {}: {e}",
                file_path.as_ref().display()
            ))
        })?;
        Self::from_yaml(&raw, env)
    }

    /// Parses configuration from YAML text, then interpolates `env` into its
    /// string values.
    pub fn from_yaml(raw: &str, env: &EnvSnapshot) -> Result<Self> {
        let mut tree: Value = serde_yaml::from_str(raw)
            .map_err(|e| GatewayError::Config(format!("failed to parse config: {e}")))?;
        interpolate_value(&mut tree, env)?;
        serde_yaml::from_value(tree)
            .map_err(|e| GatewayError::Config(format!("failed to parse config: {e}")))
    }

    /// Validates every field and produces a [`RuntimeConfig`].
    pub fn into_runtime(self) -> Result<RuntimeConfig> {
        if self.upstreams.is_empty() {
            return Err(GatewayError::Config(
                "at least one upstream must be configured".into(),
            ));
        }
        if self.routes.is_empty() {
            return Err(GatewayError::Config(
                "at least one route must be configured".into(),
            ));
        }

        let listen_str = self.listen.as_deref().unwrap_or(DEFAULT_LISTEN_ADDR);
        let listen = parse_socket_addr("listen", listen_str)?;
        let admin_listen = self
            .admin_listen
            .as_deref()
            .map(|addr| parse_socket_addr("admin_listen", addr))
            .transpose()?;

        let mut seen = HashSet::new();
        let mut upstreams = Vec::with_capacity(self.upstreams.len());
        let mut splits = Vec::new();
        for raw in self.upstreams {
            if !seen.insert(raw.id.clone()) {
                return Err(GatewayError::Config(format!(
                    "upstream {} is defined more than once",
                    raw.id
                )));
            }
            let (upstream, split) = validate_upstream(raw)?;
            upstreams.push(upstream);
            splits.extend(split);
        }

        let mut route_names = HashSet::new();
        let routes = self
            .routes
            .into_iter()
            .map(|raw| {
                if !route_names.insert(raw.name.clone()) {
                    return Err(GatewayError::Config(format!(
                        "route {} is defined more than once",
                        raw.name
                    )));
                }
                if !seen.contains(&raw.upstream) {
                    return Err(GatewayError::Config(format!(
                        "route {} references unknown upstream {}",
                        raw.name, raw.upstream
                    )));
                }
                validate_route(raw)
            })
            .collect::<Result<Vec<_>>>()?;

        let strip_response_headers = self
            .strip_response_headers
            .iter()
            .map(|h| {
                HeaderName::from_bytes(h.to_ascii_lowercase().as_bytes()).map_err(|e| {
                    GatewayError::Config(format!("invalid response header name {h}: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let health_check = self
            .health_check
            .map(|hc| {
                if !hc.path.starts_with('/') {
                    return Err(GatewayError::Config(format!(
                        "health check path must start with '/': {}",
                        hc.path
                    )));
                }
                if hc.interval_ms == 0 {
                    return Err(GatewayError::Config(
                        "health check interval must be positive".into(),
                    ));
                }
                Ok(ProbeSettings {
                    path: hc.path,
                    interval: Duration::from_millis(hc.interval_ms),
                    timeout: Duration::from_millis(hc.timeout_ms),
                })
            })
            .transpose()?;

        let passive = self.passive.unwrap_or_default();
        let thresholds = HealthThresholds {
            unhealthy_after: passive.unhealthy_after.unwrap_or(DEFAULT_UNHEALTHY_AFTER),
            healthy_after: passive.healthy_after.unwrap_or(DEFAULT_HEALTHY_AFTER),
        };
        if thresholds.unhealthy_after == 0 || thresholds.healthy_after == 0 {
            return Err(GatewayError::Config(
                "passive health thresholds must be positive".into(),
            ));
        }

        let publish = validate_publish(self.publish.unwrap_or_default())?;

        let broker = self.broker.map(|b| AmqpSettings {
            host: b.host,
            port: b.port,
            user: b.user,
            password: b.password,
            vhost: b.vhost,
            queue: b.queue,
        });
        if let Some(broker) = &broker {
            if broker.host.is_empty() || broker.queue.is_empty() {
                return Err(GatewayError::Config(
                    "broker host and queue must not be empty".into(),
                ));
            }
        }

        Ok(RuntimeConfig {
            listen,
            admin_listen,
            upstreams,
            splits,
            routes,
            max_body_size: self.max_body_size.unwrap_or(DEFAULT_MAX_BODY_SIZE),
            strip_response_headers,
            connect_timeout: self
                .connect_timeout_ms
                .map_or(DEFAULT_CONNECT_TIMEOUT, Duration::from_millis),
            request_timeout: self
                .request_timeout_ms
                .map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_millis),
            pool_idle_timeout: self
                .pool_idle_timeout_ms
                .map_or(DEFAULT_POOL_IDLE_TIMEOUT, Duration::from_millis),
            pool_max_idle_per_host: self
                .pool_max_idle_per_host
                .unwrap_or(DEFAULT_POOL_MAX_IDLE_PER_HOST),
            max_concurrent_requests: self
                .max_concurrent_requests
                .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS),
            health_check,
            thresholds,
            broker,
            publish,
        })
    }
}

fn parse_socket_addr(field: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse::<SocketAddr>()
        .map_err(|e| GatewayError::Config(format!("invalid {field} address \"{value}\": {e}")))
}

fn parse_target_address(upstream: &str, address: &str) -> Result<Authority> {
    let authority = address.parse::<Authority>().map_err(|e| {
        GatewayError::Config(format!(
            "upstream {upstream}: invalid target address \"{address}\": {e}"
        ))
    })?;
    if authority.port_u16().is_none() || authority.host().is_empty() {
        return Err(GatewayError::Config(format!(
            "upstream {upstream}: target address must be host:port, got \"{address}\""
        )));
    }
    Ok(authority)
}

fn validate_upstream(raw: UpstreamConfig) -> Result<(Upstream, Option<StranglerSplit>)> {
    let hash_on = match (raw.hash_on, raw.hash_on_header) {
        (HashOnConfig::None, _) => HashOn::None,
        (HashOnConfig::ClientIp, _) => HashOn::ClientIp,
        (HashOnConfig::Header, Some(name)) if HeaderName::from_bytes(name.as_bytes()).is_ok() => {
            HashOn::Header(name.to_ascii_lowercase())
        }
        (HashOnConfig::Header, _) => {
            return Err(GatewayError::Config(format!(
                "upstream {}: hash_on header requires a valid hash_on_header",
                raw.id
            )));
        }
    };

    let mut targets = raw
        .targets
        .iter()
        .map(|t| Ok(Target::new(parse_target_address(&raw.id, &t.address)?, t.weight)))
        .collect::<Result<Vec<_>>>()?;

    let split = match raw.strangler {
        Some(strangler) => {
            let [legacy, modern] = targets.as_slice() else {
                return Err(GatewayError::Config(format!(
                    "upstream {}: strangler split needs exactly two targets, got {}",
                    raw.id,
                    targets.len()
                )));
            };
            let split = StranglerSplit::new(
                raw.id.clone(),
                legacy.address.clone(),
                modern.address.clone(),
            );
            let weights = split.weights(strangler.legacy_percent)?;
            for (target, (_, weight)) in targets.iter_mut().zip(weights) {
                target.weight = weight;
            }
            Some(split)
        }
        None => None,
    };

    let upstream = Upstream::new(raw.id, hash_on, targets)?;
    Ok((upstream, split))
}

fn validate_route(raw: RouteConfig) -> Result<Route> {
    let pattern = PathPattern::parse(&raw.path).map_err(|e| {
        GatewayError::Config(format!("route {}: {e}", raw.name))
    })?;

    let mut methods = Vec::with_capacity(raw.methods.len());
    for m in &raw.methods {
        let method = Method::from_bytes(m.to_ascii_uppercase().as_bytes()).map_err(|e| {
            GatewayError::Config(format!("route {}: invalid method {m}: {e}", raw.name))
        })?;
        if !methods.contains(&method) {
            methods.push(method);
        }
    }

    Ok(Route {
        name: raw.name,
        pattern,
        methods,
        upstream: raw.upstream,
        strip_path: raw.strip_path,
        preserve_host: raw.preserve_host,
    })
}

fn validate_publish(raw: PublishConfig) -> Result<PublishSettings> {
    let attempts = raw.attempts.unwrap_or(DEFAULT_PUBLISH_ATTEMPTS);
    if attempts == 0 {
        return Err(GatewayError::Config(
            "publish attempts must be at least 1".into(),
        ));
    }
    let pending_capacity = raw.pending_capacity.unwrap_or(DEFAULT_PENDING_CAPACITY);
    if pending_capacity == 0 {
        return Err(GatewayError::Config(
            "publish pending_capacity must be positive".into(),
        ));
    }

    Ok(PublishSettings {
        retry: RetryPolicy {
            attempts,
            initial_backoff: raw
                .initial_backoff_ms
                .map_or(DEFAULT_PUBLISH_INITIAL_BACKOFF, Duration::from_millis),
            max_backoff: raw
                .max_backoff_ms
                .map_or(DEFAULT_PUBLISH_MAX_BACKOFF, Duration::from_millis),
        },
        ack_wait: raw.ack_wait_ms.map_or(DEFAULT_ACK_WAIT, Duration::from_millis),
        pending_capacity,
    })
}
