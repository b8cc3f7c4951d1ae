//! Gateway router: turns an inbound request into a [`ForwardInstruction`].
//!
//! The router resolves the route, picks a target from the route's upstream via
//! the [`WeightedSelector`] over the current registry snapshot, computes the
//! forwarded path and prepares outbound headers. It holds route and upstream
//! ids only; targets are owned by the registry.

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use hyper::http::uri::{Authority, PathAndQuery};
use hyper::{HeaderMap, Method, Request, Uri};
use tracing::debug;

use crate::headers;
use crate::matcher::{Params, Route, RouteMatcher};
use crate::registry::{HashOn, Target, TargetRegistry, Upstream};
use crate::selector::{Affinity, WeightedSelector};
use crate::{GatewayError, Result};

/// Everything needed to forward one request to one target.
#[derive(Debug, Clone)]
pub struct ForwardInstruction {
    pub method: Method,
    pub upstream: String,
    pub target: Target,
    pub route: Arc<Route>,
    pub params: Params,
    /// Final path and query sent to the target.
    pub path_and_query: PathAndQuery,
    /// Outbound request headers, hop-by-hop headers already removed.
    pub headers: HeaderMap,
    affinity: Affinity,
}

impl ForwardInstruction {
    /// Absolute URI of the request on the selected target.
    pub fn uri(&self) -> Result<Uri> {
        Uri::builder()
            .scheme("http")
            .authority(self.target.address.clone())
            .path_and_query(self.path_and_query.clone())
            .build()
            .map_err(GatewayError::from)
    }
}

/// Composes route matching, weighted selection and header preparation.
#[derive(Debug)]
pub struct GatewayRouter {
    matcher: ArcSwap<RouteMatcher>,
    registry: Arc<TargetRegistry>,
    selector: WeightedSelector,
}

impl GatewayRouter {
    /// Builds a router over the given routes.
    ///
    /// Fails with [`GatewayError::NotFound`] if a route references an
    /// upstream the registry does not know.
    pub fn new(matcher: RouteMatcher, registry: Arc<TargetRegistry>) -> Result<Self> {
        check_upstreams(&matcher, &registry)?;
        Ok(Self {
            matcher: ArcSwap::from_pointee(matcher),
            registry,
            selector: WeightedSelector::new(),
        })
    }

    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    /// Applies a reloaded route table together with its upstreams.
    ///
    /// Routes are checked against `upstreams` before anything changes. New
    /// and changed upstreams go in first, then the route table is swapped,
    /// then upstreams no route may reach any more are dropped, so a request
    /// always resolves against a route table whose upstreams exist.
    pub fn reload(&self, matcher: RouteMatcher, upstreams: Vec<Upstream>) -> Result<()> {
        let ids = upstreams
            .iter()
            .map(|u| u.id().to_owned())
            .collect::<Vec<_>>();
        for route in matcher.routes() {
            if !ids.contains(&route.upstream) {
                return Err(GatewayError::NotFound {
                    kind: "upstream",
                    key: format!("{} (referenced by route {})", route.upstream, route.name),
                });
            }
        }

        self.registry.merge(upstreams)?;
        self.matcher.store(Arc::new(matcher));
        let keep = ids.iter().map(String::as_str).collect::<Vec<_>>();
        for id in self.registry.retain(&keep)? {
            debug!(upstream = %id, "upstream removed by reload");
        }
        Ok(())
    }

    /// Resolves a request to a target and prepares it for forwarding.
    pub fn route<B>(&self, req: &Request<B>, client_addr: SocketAddr) -> Result<ForwardInstruction> {
        let path = req.uri().path();
        let found = self.matcher.load().find(req.method(), path)?;
        let upstream = self.registry.get(&found.route.upstream)?;

        let affinity = affinity_for(&upstream, req, client_addr);
        let target = self.selector.select(&upstream, affinity)?;

        let forward_path = found.forward_path(path);
        let path_and_query = match req.uri().query() {
            Some(query) => format!("{forward_path}?{query}"),
            None => forward_path.into_owned(),
        }
        .parse::<PathAndQuery>()
        .map_err(|e| GatewayError::Internal(format!("invalid forward path: {e}")))?;

        let mut outbound = req.headers().clone();
        headers::strip_hop_by_hop(&mut outbound);
        headers::inject_forwarding_headers(&mut outbound, client_addr);
        if let Some(prefix) = found.stripped_prefix(path) {
            headers::inject_forwarded_prefix(&mut outbound, prefix);
        }
        headers::apply_host(&mut outbound, &target.address, found.route.preserve_host);

        Ok(ForwardInstruction {
            method: req.method().clone(),
            upstream: upstream.id().to_owned(),
            target,
            route: found.route,
            params: found.params,
            path_and_query,
            headers: outbound,
            affinity,
        })
    }

    /// Re-selects a target in the same upstream, skipping `tried`.
    ///
    /// Used once after a forwarding failure; never crosses upstreams.
    pub fn retarget(
        &self,
        instruction: &ForwardInstruction,
        tried: &[Authority],
    ) -> Result<ForwardInstruction> {
        let upstream = self.registry.get(&instruction.upstream)?;
        let target = self
            .selector
            .select_excluding(&upstream, instruction.affinity, tried)?;

        let mut next = instruction.clone();
        if !instruction.route.preserve_host {
            next.headers.remove(hyper::header::HOST);
        }
        headers::apply_host(
            &mut next.headers,
            &target.address,
            instruction.route.preserve_host,
        );
        next.target = target;
        Ok(next)
    }
}

fn check_upstreams(matcher: &RouteMatcher, registry: &TargetRegistry) -> Result<()> {
    for route in matcher.routes() {
        if !registry.contains(&route.upstream) {
            return Err(GatewayError::NotFound {
                kind: "upstream",
                key: format!("{} (referenced by route {})", route.upstream, route.name),
            });
        }
    }
    Ok(())
}

fn affinity_for<B>(upstream: &Upstream, req: &Request<B>, client_addr: SocketAddr) -> Affinity {
    match upstream.hash_on() {
        HashOn::None => Affinity::Random,
        HashOn::ClientIp => Affinity::from_key(&client_addr.ip()),
        HashOn::Header(name) => req
            .headers()
            .get(name.as_str())
            .map_or(Affinity::Random, |value| Affinity::from_key(value.as_bytes())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::PathPattern;
    use crate::registry::HealthStatus;
    use hyper::header::HOST;

    fn route(name: &str, path: &str, upstream: &str, strip_path: bool) -> Route {
        Route {
            name: name.into(),
            pattern: PathPattern::parse(path).unwrap(),
            methods: vec![Method::GET, Method::POST, Method::PUT],
            upstream: upstream.into(),
            strip_path,
            preserve_host: false,
        }
    }

    fn registry() -> Arc<TargetRegistry> {
        let registry = TargetRegistry::new();
        registry
            .register(
                "user_service_upstream",
                vec![
                    Target::new("user-v1:5001".parse().unwrap(), 50),
                    Target::new("user-v2:5002".parse().unwrap(), 50),
                ],
            )
            .unwrap();
        registry
            .register(
                "order_service_upstream",
                vec![Target::new("orders:5003".parse().unwrap(), 100)],
            )
            .unwrap();
        Arc::new(registry)
    }

    fn router(routes: Vec<Route>) -> GatewayRouter {
        GatewayRouter::new(RouteMatcher::new(routes), registry()).unwrap()
    }

    fn client() -> SocketAddr {
        "10.1.2.3:40000".parse().unwrap()
    }

    fn request(method: Method, uri: &str) -> Request<()> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(HOST, "gateway:8000")
            .header("connection", "keep-alive")
            .body(())
            .unwrap()
    }

    #[test]
    fn unknown_upstream_is_fatal() {
        let err = GatewayRouter::new(
            RouteMatcher::new(vec![route("ghost", "/ghost", "nowhere", false)]),
            registry(),
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound { kind: "upstream", .. }));
    }

    #[test]
    fn forwards_order_action_verbatim_with_params() {
        let router = router(vec![route(
            "order-action",
            "/orders/{order_id}/{action:status|details}",
            "order_service_upstream",
            false,
        )]);

        let instr = router
            .route(&request(Method::PUT, "/orders/abc-123/status"), client())
            .unwrap();

        assert_eq!(instr.path_and_query.as_str(), "/orders/abc-123/status");
        assert_eq!(instr.params["order_id"], "abc-123");
        assert_eq!(instr.params["action"], "status");
        assert_eq!(instr.target.address, "orders:5003");
        assert_eq!(instr.uri().unwrap(), "http://orders:5003/orders/abc-123/status");
    }

    #[test]
    fn outbound_headers_are_prepared() {
        let router = router(vec![route("orders", "/orders", "order_service_upstream", false)]);

        let instr = router
            .route(&request(Method::GET, "/orders?page=2"), client())
            .unwrap();

        assert_eq!(instr.path_and_query.as_str(), "/orders?page=2");
        assert_eq!(instr.headers[HOST], "orders:5003");
        assert_eq!(instr.headers["x-forwarded-for"], "10.1.2.3");
        assert_eq!(instr.headers["x-forwarded-host"], "gateway:8000");
        assert!(!instr.headers.contains_key("connection"));
    }

    #[test]
    fn strip_path_removes_prefix_and_sets_forwarded_prefix() {
        let router = router(vec![route("users", "~/users", "user_service_upstream", true)]);

        let instr = router
            .route(&request(Method::GET, "/users/42?full=1"), client())
            .unwrap();

        assert_eq!(instr.path_and_query.as_str(), "/42?full=1");
        assert_eq!(instr.headers["x-forwarded-prefix"], "/users");
    }

    #[test]
    fn preserve_host_keeps_client_host() {
        let mut users = route("users", "/users/{user_id}", "user_service_upstream", false);
        users.preserve_host = true;
        let router = router(vec![users]);

        let instr = router
            .route(&request(Method::GET, "/users/7"), client())
            .unwrap();

        assert_eq!(instr.headers[HOST], "gateway:8000");
    }

    #[test]
    fn retarget_picks_other_target_and_rewrites_host() {
        let router = router(vec![route(
            "users",
            "/users/{user_id}",
            "user_service_upstream",
            false,
        )]);

        let first = router
            .route(&request(Method::GET, "/users/7"), client())
            .unwrap();
        let second = router
            .retarget(&first, &[first.target.address.clone()])
            .unwrap();

        assert_ne!(second.target.address, first.target.address);
        assert_eq!(second.headers[HOST], second.target.address.as_str());
        assert_eq!(second.path_and_query, first.path_and_query);
    }

    #[test]
    fn retarget_with_single_target_fails() {
        let router = router(vec![route("orders", "/orders", "order_service_upstream", false)]);
        let first = router
            .route(&request(Method::GET, "/orders"), client())
            .unwrap();

        let err = router
            .retarget(&first, &[first.target.address.clone()])
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyTarget { .. }));
    }

    #[test]
    fn unhealthy_upstream_yields_no_healthy_target() {
        let router = router(vec![route("orders", "/orders", "order_service_upstream", false)]);
        router
            .registry()
            .set_health(&"orders:5003".parse().unwrap(), HealthStatus::Unhealthy)
            .unwrap();

        let err = router
            .route(&request(Method::GET, "/orders"), client())
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyTarget { .. }));

        router
            .registry()
            .set_health(&"orders:5003".parse().unwrap(), HealthStatus::Healthy)
            .unwrap();
        assert!(router.route(&request(Method::GET, "/orders"), client()).is_ok());
    }

    #[test]
    fn client_ip_affinity_is_sticky() {
        let registry = registry();
        registry
            .register_upstream(
                Upstream::new(
                    "user_service_upstream",
                    HashOn::ClientIp,
                    vec![
                        Target::new("user-v1:5001".parse().unwrap(), 50),
                        Target::new("user-v2:5002".parse().unwrap(), 50),
                    ],
                )
                .unwrap(),
            )
            .unwrap();
        let router = GatewayRouter::new(
            RouteMatcher::new(vec![route(
                "users",
                "/users/{user_id}",
                "user_service_upstream",
                false,
            )]),
            registry,
        )
        .unwrap();

        let first = router
            .route(&request(Method::GET, "/users/7"), client())
            .unwrap();
        for _ in 0..20 {
            let again = router
                .route(&request(Method::GET, "/users/7"), client())
                .unwrap();
            assert_eq!(again.target.address, first.target.address);
        }
    }

    #[test]
    fn reload_moves_routes_and_upstreams_together() {
        let router = router(vec![route("orders", "/orders", "order_service_upstream", false)]);
        let billing = Upstream::new(
            "billing_upstream",
            HashOn::None,
            vec![Target::new("billing:5004".parse().unwrap(), 1)],
        )
        .unwrap();

        router
            .reload(
                RouteMatcher::new(vec![route("billing", "/billing", "billing_upstream", false)]),
                vec![billing],
            )
            .unwrap();

        let fwd = router.route(&request(Method::GET, "/billing"), client()).unwrap();
        assert_eq!(fwd.target.address, "billing:5004");
        assert!(router.route(&request(Method::GET, "/orders"), client()).is_err());
        assert!(!router.registry().contains("order_service_upstream"));
        assert!(!router.registry().contains("user_service_upstream"));
    }

    #[test]
    fn rejected_reload_changes_nothing() {
        let router = router(vec![route("orders", "/orders", "order_service_upstream", false)]);
        let version = router.registry().snapshot().version();

        let err = router
            .reload(
                RouteMatcher::new(vec![route("orders", "/orders", "order_service_upstream", false)]),
                vec![
                    Upstream::new(
                        "billing_upstream",
                        HashOn::None,
                        vec![Target::new("billing:5004".parse().unwrap(), 1)],
                    )
                    .unwrap(),
                ],
            )
            .unwrap_err();

        assert!(matches!(err, GatewayError::NotFound { kind: "upstream", .. }));
        assert_eq!(router.registry().snapshot().version(), version);
        assert!(!router.registry().contains("billing_upstream"));
        assert!(router.route(&request(Method::GET, "/orders"), client()).is_ok());
    }
}
