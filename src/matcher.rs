//! Route matching for inbound requests.
//!
//! Route paths are compiled once at startup into a [`PathPattern`]:
//!
//! - **Literal** (`/orders`): matches the path exactly. A single trailing
//!   slash difference is ignored, so `/users/` also matches `/users`.
//! - **Template** (`/orders/{order_id}/{action:status|details}`): each
//!   `{name}` binds one path segment, `{name:regex}` constrains it.
//! - **Regex** (`~/orders/(?P<order_id>[^/]+)`): a raw regex anchored at the
//!   start of the path, the way Kong treats `~`-prefixed paths.
//!
//! Precedence: exact literal matches beat patterns; among patterns the one with
//! the longest static prefix wins; remaining ties keep configuration order. The
//! method check runs after path precedence, so a path hit with a disallowed
//! method yields 405 rather than 404.

use std::collections::BTreeMap;
use std::sync::Arc;

use hyper::Method;
use regex::Regex;

use crate::{GatewayError, Result};

/// Parameters extracted from named captures, keyed by capture name.
pub type Params = BTreeMap<String, String>;

/// A compiled path pattern.
#[derive(Debug, Clone)]
pub enum PathPattern {
    Literal(String),
    Pattern {
        /// The pattern as written in the configuration.
        source: String,
        regex: Regex,
        /// Literal text the pattern always starts with; used for precedence.
        static_prefix: String,
        /// Capture names in declaration order.
        params: Vec<String>,
    },
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source() == other.source()
    }
}

impl Eq for PathPattern {}

impl PathPattern {
    /// Compiles a configured path into a pattern.
    pub fn parse(path: &str) -> Result<Self> {
        if let Some(raw) = path.strip_prefix('~') {
            return Self::from_regex(path, raw);
        }

        if !path.starts_with('/') {
            return Err(GatewayError::Config(format!(
                "route path must start with '/': {path}"
            )));
        }

        if path.contains('{') {
            let regex = template_to_regex(path)?;
            return Self::from_regex(path, &regex);
        }

        Ok(Self::Literal(path.to_owned()))
    }

    fn from_regex(source: &str, raw: &str) -> Result<Self> {
        let anchored = if raw.starts_with('^') {
            raw.to_owned()
        } else {
            format!("^{raw}")
        };

        let regex = Regex::new(&anchored)
            .map_err(|e| GatewayError::Config(format!("invalid route pattern {source}: {e}")))?;

        let params = regex
            .capture_names()
            .flatten()
            .map(str::to_owned)
            .collect::<Vec<_>>();

        Ok(Self::Pattern {
            source: source.to_owned(),
            static_prefix: static_prefix(&anchored),
            regex,
            params,
        })
    }

    /// The pattern as written in the configuration.
    pub fn source(&self) -> &str {
        match self {
            Self::Literal(path) => path,
            Self::Pattern { source, .. } => source,
        }
    }

    /// Capture names this pattern binds.
    pub fn param_names(&self) -> &[String] {
        match self {
            Self::Literal(_) => &[],
            Self::Pattern { params, .. } => params,
        }
    }

    /// Attempts to match `path`, returning the precedence rank, the matched
    /// prefix length and any captured parameters.
    fn matches(&self, path: &str) -> Option<(Rank, usize, Params)> {
        match self {
            Self::Literal(literal) => {
                let hit = path == literal
                    || without_trailing_slash(path) == without_trailing_slash(literal);
                hit.then(|| (Rank::Exact, path.len(), Params::new()))
            }
            Self::Pattern {
                regex,
                static_prefix,
                params,
                ..
            } => {
                let captures = regex.captures(path)?;
                let end = captures.get(0).map_or(0, |m| m.end());
                if !at_segment_boundary(path, end) {
                    return None;
                }
                let values = params
                    .iter()
                    .filter_map(|name| {
                        captures
                            .name(name)
                            .map(|m| (name.clone(), m.as_str().to_owned()))
                    })
                    .collect();
                Some((Rank::Pattern(static_prefix.len()), end, values))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Rank {
    Pattern(usize),
    Exact,
}

/// A configured route mapping a path pattern and method set to an upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub name: String,
    pub pattern: PathPattern,
    /// Allowed methods. Empty means any method.
    pub methods: Vec<Method>,
    pub upstream: String,
    /// Remove the matched prefix before forwarding.
    pub strip_path: bool,
    /// Forward the client's `Host` header instead of the target authority.
    pub preserve_host: bool,
}

impl Route {
    pub fn allows(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }
}

/// Result of matching one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub route: Arc<Route>,
    pub params: Params,
    /// Byte length of the path prefix consumed by the pattern.
    pub matched_len: usize,
}

impl RouteMatch {
    /// Computes the path to forward, honoring the route's `strip_path` flag.
    pub fn forward_path<'a>(&self, path: &'a str) -> std::borrow::Cow<'a, str> {
        if !self.route.strip_path {
            return path.into();
        }
        let rest = path.get(self.matched_len..).unwrap_or_default();
        if rest.starts_with('/') {
            rest.into()
        } else {
            format!("/{rest}").into()
        }
    }

    /// The prefix removed by `strip_path`, if any.
    pub fn stripped_prefix<'a>(&self, path: &'a str) -> Option<&'a str> {
        if !self.route.strip_path {
            return None;
        }
        path.get(..self.matched_len)
            .map(|p| p.trim_end_matches('/'))
            .filter(|p| !p.is_empty())
    }
}

/// Compiled, immutable route table.
#[derive(Debug, Clone, Default)]
pub struct RouteMatcher {
    routes: Vec<Arc<Route>>,
}

impl RouteMatcher {
    pub fn new(routes: Vec<Route>) -> Self {
        Self {
            routes: routes.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    /// Finds the route for `(method, path)`.
    ///
    /// Fails with [`GatewayError::NoRoute`] if no path matches, or
    /// [`GatewayError::MethodNotAllowed`] if matching paths exist but none
    /// allows the method.
    pub fn find(&self, method: &Method, path: &str) -> Result<RouteMatch> {
        let mut candidates = self
            .routes
            .iter()
            .filter_map(|route| {
                route
                    .pattern
                    .matches(path)
                    .map(|(rank, matched_len, params)| (rank, route, matched_len, params))
            })
            .collect::<Vec<_>>();

        if candidates.is_empty() {
            return Err(GatewayError::NoRoute {
                method: method.clone(),
                path: path.to_owned(),
            });
        }

        // Stable sort keeps configuration order for equal ranks.
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        let mut allowed: Vec<Method> = Vec::new();
        for (_, route, matched_len, params) in candidates {
            if route.allows(method) {
                return Ok(RouteMatch {
                    route: Arc::clone(route),
                    params,
                    matched_len,
                });
            }
            for m in &route.methods {
                if !allowed.contains(m) {
                    allowed.push(m.clone());
                }
            }
        }

        Err(GatewayError::MethodNotAllowed {
            path: path.to_owned(),
            allowed,
        })
    }
}

/// Converts a `{name}` / `{name:regex}` template into an anchored regex.
fn template_to_regex(template: &str) -> Result<String> {
    let mut regex = String::from("^");
    let mut seen: Vec<&str> = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        regex.push_str(&regex::escape(&rest[..open]));
        let close = rest[open..].find('}').map(|i| open + i).ok_or_else(|| {
            GatewayError::Config(format!("unclosed '{{' in route path {template}"))
        })?;

        let placeholder = &rest[open + 1..close];
        let (name, constraint) = placeholder
            .split_once(':')
            .unwrap_or((placeholder, "[^/]+"));

        if !is_identifier(name) {
            return Err(GatewayError::Config(format!(
                "invalid parameter name '{name}' in route path {template}"
            )));
        }
        if seen.contains(&name) {
            return Err(GatewayError::Config(format!(
                "duplicate parameter '{name}' in route path {template}"
            )));
        }
        seen.push(name);

        regex.push_str(&format!("(?P<{name}>{constraint})"));
        rest = &rest[close + 1..];
    }

    regex.push_str(&regex::escape(without_trailing_slash(rest)));
    regex.push_str("/?$");
    Ok(regex)
}

/// Drops at most one trailing `/`.
fn without_trailing_slash(path: &str) -> &str {
    path.strip_suffix('/').unwrap_or(path)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Leading literal text of an anchored regex, up to the first metacharacter.
fn static_prefix(anchored: &str) -> String {
    anchored
        .trim_start_matches('^')
        .chars()
        .take_while(|c| !r"\.+*?()|[]{}^$".contains(*c))
        .collect()
}

/// A pattern match must end on a segment boundary so `/users` does not match
/// `/usersettings`.
fn at_segment_boundary(path: &str, end: usize) -> bool {
    end == path.len() || path[..end].ends_with('/') || path[end..].starts_with('/')
}
