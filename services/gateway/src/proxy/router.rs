//! Route table and routing decisions.
//!
//! Routes map a request to a backend service name. Matching is done in three
//! priority classes:
//!
//! 1. Virtual-service header, exact value match
//! 2. Host header, exact match after normalisation
//! 3. Path prefix, longest prefix wins
//!
//! Within a class the first configured route wins. The table is replaced as a
//! whole with a single pointer swap, so a request is always resolved against
//! one consistent set of routes.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use http::HeaderMap;
use http::Uri;
use switchyard_registry::ServiceName;
use tracing::{debug, info};

/// Default header naming the target virtual service.
pub const DEFAULT_SERVICE_HEADER: &str = "x-switchyard-service";

/// What a route matches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMatch {
    /// Exact value of the virtual-service header.
    Service(String),
    /// Normalised host name.
    Host(String),
    /// Path prefix, stored without the trailing `/*`. Empty matches every path.
    PathPrefix(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub id: String,
    pub matcher: RouteMatch,
    pub target: ServiceName,
}

impl Route {
    pub fn service(id: impl Into<String>, name: &str, target: ServiceName) -> Self {
        Self {
            id: id.into(),
            matcher: RouteMatch::Service(name.trim().to_string()),
            target,
        }
    }

    pub fn host(id: impl Into<String>, host: &str, target: ServiceName) -> Self {
        Self {
            id: id.into(),
            matcher: RouteMatch::Host(Self::normalize_hostname(host)),
            target,
        }
    }

    pub fn path_prefix(id: impl Into<String>, pattern: &str, target: ServiceName) -> Self {
        Self {
            id: id.into(),
            matcher: RouteMatch::PathPrefix(Self::normalize_prefix(pattern)),
            target,
        }
    }

    /// Normalize a hostname for matching.
    ///
    /// - Convert to lowercase
    /// - Strip any port
    /// - Trim trailing dot
    pub fn normalize_hostname(hostname: &str) -> String {
        let hostname = hostname.trim();
        let host = if let Some(rest) = hostname.strip_prefix('[') {
            // [v6]:port
            rest.split(']').next().unwrap_or(rest)
        } else if hostname.matches(':').count() == 1 {
            hostname.split(':').next().unwrap_or(hostname)
        } else {
            hostname
        };
        host.to_lowercase().trim_end_matches('.').to_string()
    }

    /// Normalize a path-prefix pattern.
    ///
    /// `/api/v3/*`, `/api/v3/` and `/api/v3` all become `/api/v3`; `/` and
    /// `/*` become the empty prefix.
    pub fn normalize_prefix(pattern: &str) -> String {
        let pattern = pattern.trim();
        let pattern = pattern.strip_suffix('*').unwrap_or(pattern);
        let pattern = pattern.trim_end_matches('/');
        if pattern.is_empty() || pattern.starts_with('/') {
            pattern.to_string()
        } else {
            format!("/{pattern}")
        }
    }

    /// Whether `prefix` (normalised) covers `path` on a segment boundary.
    fn prefix_matches(prefix: &str, path: &str) -> bool {
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.is_empty(),
            None => false,
        }
    }
}

/// Result of a routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Route found, proceed with endpoint selection.
    Matched { route: Route },
    /// No route matches the request.
    NoRoute { reason: String },
}

/// The parts of a request routing looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteKey {
    pub service: Option<String>,
    /// Normalised host.
    pub host: Option<String>,
    pub path: String,
}

impl RouteKey {
    pub fn new(service: Option<&str>, host: Option<&str>, path: &str) -> Self {
        Self {
            service: service.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
            host: host
                .map(Route::normalize_hostname)
                .filter(|h| !h.is_empty()),
            path: if path.is_empty() { "/" } else { path }.to_string(),
        }
    }

    /// Extract the routing key from request headers and URI.
    pub fn from_request(headers: &HeaderMap, uri: &Uri, service_header: &str) -> Self {
        let service = headers
            .get(service_header)
            .and_then(|v| v.to_str().ok());
        let host = headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| uri.authority().map(|a| a.as_str()));
        Self::new(service, host, uri.path())
    }
}

/// Immutable snapshot of route data for lock-free reads.
#[derive(Debug, Default)]
struct RouteSnapshot {
    routes: Vec<Route>,
    by_service: HashMap<String, Route>,
    by_host: HashMap<String, Route>,
    /// Prefix routes, longest prefix first, configured order within a length.
    prefixes: Vec<(String, Route)>,
}

impl RouteSnapshot {
    fn from_routes(routes: Vec<Route>) -> Self {
        let mut by_service = HashMap::new();
        let mut by_host = HashMap::new();
        let mut prefixes = Vec::new();

        for route in &routes {
            match &route.matcher {
                RouteMatch::Service(name) => {
                    by_service
                        .entry(name.clone())
                        .or_insert_with(|| route.clone());
                }
                RouteMatch::Host(host) => {
                    by_host.entry(host.clone()).or_insert_with(|| route.clone());
                }
                RouteMatch::PathPrefix(prefix) => prefixes.push((prefix.clone(), route.clone())),
            }
        }
        // Stable sort keeps configured order for equal lengths.
        prefixes.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));

        Self {
            routes,
            by_service,
            by_host,
            prefixes,
        }
    }

    fn resolve(&self, key: &RouteKey) -> RoutingDecision {
        if let Some(route) = key.service.as_ref().and_then(|s| self.by_service.get(s)) {
            return RoutingDecision::Matched {
                route: route.clone(),
            };
        }
        if let Some(route) = key.host.as_ref().and_then(|h| self.by_host.get(h)) {
            return RoutingDecision::Matched {
                route: route.clone(),
            };
        }
        if let Some((_, route)) = self
            .prefixes
            .iter()
            .find(|(prefix, _)| Route::prefix_matches(prefix, &key.path))
        {
            return RoutingDecision::Matched {
                route: route.clone(),
            };
        }

        RoutingDecision::NoRoute {
            reason: format!(
                "service={} host={} path={}",
                key.service.as_deref().unwrap_or("-"),
                key.host.as_deref().unwrap_or("-"),
                key.path
            ),
        }
    }
}

/// Route table managing all active routes.
///
/// Uses ArcSwap for lock-free atomic updates.
pub struct RouteTable {
    snapshot: ArcSwap<RouteSnapshot>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RouteSnapshot::from_routes(routes)),
        }
    }

    /// Replace the entire route table atomically.
    pub fn update(&self, routes: Vec<Route>) {
        let route_count = routes.len();
        self.snapshot
            .store(Arc::new(RouteSnapshot::from_routes(routes)));
        info!(route_count, "Route table updated atomically");
    }

    /// Make a routing decision for `key`.
    pub fn resolve(&self, key: &RouteKey) -> RoutingDecision {
        let decision = self.snapshot.load().resolve(key);
        if let RoutingDecision::Matched { route } = &decision {
            debug!(route_id = %route.id, target = %route.target, "Route matched");
        }
        decision
    }

    /// Distinct target services, in configured order.
    pub fn targets(&self) -> Vec<ServiceName> {
        let snapshot = self.snapshot.load();
        let mut targets: Vec<ServiceName> = Vec::new();
        for route in &snapshot.routes {
            if !targets.contains(&route.target) {
                targets.push(route.target.clone());
            }
        }
        targets
    }

    pub fn routes(&self) -> Vec<Route> {
        self.snapshot.load().routes.clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().routes.is_empty()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
