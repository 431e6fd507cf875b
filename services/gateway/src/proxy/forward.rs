//! Per-request proxy core.
//!
//! Each request moves through
//! `Received -> Authenticating -> Routing -> Forwarding -> Completed`; an
//! authentication or routing failure ends it as `Rejected`, a backend failure
//! as `Failed`. Bodies are streamed in both directions.
//!
//! A connection failure before the request reached the backend is retried
//! once on another endpoint of the same service. Once any part of the request
//! has been written nothing is retried.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, Request, Response, Uri, Version};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, field, info, info_span, warn, Instrument, Span};
use ulid::Ulid;

use crate::discovery::{Endpoint, SnapshotStream};
use crate::error::GatewayError;
use crate::lifecycle::Service;
use crate::proxy::balancer::EndpointSelector;
use crate::proxy::body::{BackendBody, GatewayBody, ReleaseBody};
use crate::proxy::pool::{PoolManager, SendFailure};
use crate::proxy::router::{RouteKey, RouteTable, RoutingDecision};
use crate::security::{Identity, RequestContext, SecurityGate};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Attempts per request, including the first.
pub const MAX_ATTEMPTS: usize = 2;

/// How long start waits for route targets to sync with the registry.
pub const WARM_UP_TIMEOUT: Duration = Duration::from_secs(5);

/// Headers that apply to a single hop and are never forwarded.
static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Request counters.
#[derive(Debug, Default)]
pub struct RequestStats {
    pub received: AtomicU64,
    pub forwarded: AtomicU64,
    pub rejected_auth: AtomicU64,
    pub auth_unavailable: AtomicU64,
    pub rejected_no_route: AtomicU64,
    pub unavailable: AtomicU64,
    pub pool_exhausted: AtomicU64,
    pub backend_failed: AtomicU64,
    pub retried: AtomicU64,
    pub cancelled: AtomicU64,
}

/// Point-in-time copy of [`RequestStats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestStatsSnapshot {
    pub received: u64,
    pub forwarded: u64,
    pub rejected_auth: u64,
    pub auth_unavailable: u64,
    pub rejected_no_route: u64,
    pub unavailable: u64,
    pub pool_exhausted: u64,
    pub backend_failed: u64,
    pub retried: u64,
    pub cancelled: u64,
}

impl RequestStats {
    pub fn snapshot(&self) -> RequestStatsSnapshot {
        RequestStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            rejected_auth: self.rejected_auth.load(Ordering::Relaxed),
            auth_unavailable: self.auth_unavailable.load(Ordering::Relaxed),
            rejected_no_route: self.rejected_no_route.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            backend_failed: self.backend_failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    fn record_failure(&self, err: &GatewayError) {
        let counter = match err {
            GatewayError::AuthenticationFailure(_) => &self.rejected_auth,
            GatewayError::SecurityBackendUnavailable(_) => &self.auth_unavailable,
            GatewayError::NoRouteMatched(_) => &self.rejected_no_route,
            GatewayError::ServiceUnavailable(_) => &self.unavailable,
            GatewayError::PoolExhausted { .. } => &self.pool_exhausted,
            GatewayError::BackendConnectionFailure { .. }
            | GatewayError::BackendProtocolFailure { .. } => &self.backend_failed,
            GatewayError::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counts a request as cancelled if its handler is dropped before a
/// response exists, which is how a client disconnect surfaces.
struct InFlight<'a> {
    stats: &'a RequestStats,
    answered: bool,
}

impl<'a> InFlight<'a> {
    fn new(stats: &'a RequestStats) -> Self {
        Self {
            stats,
            answered: false,
        }
    }

    fn answered(&mut self) {
        self.answered = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.answered {
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!("Client went away before a response was ready");
        }
    }
}

/// A failed attempt, with the request handed back when it is still intact.
struct AttemptFailure {
    error: GatewayError,
    request: Option<Request<BackendBody>>,
}

impl AttemptFailure {
    fn new(error: GatewayError, request: Option<Request<BackendBody>>) -> Self {
        Self { error, request }
    }
}

/// Forwards requests from inbound connections to backends.
pub struct Forwarder {
    security: Arc<SecurityGate>,
    routes: Arc<RouteTable>,
    selector: Arc<EndpointSelector>,
    pools: PoolManager,
    service_header: HeaderName,
    stats: RequestStats,
    /// Subscriptions that keep every route target watched while running.
    held: Mutex<Vec<SnapshotStream>>,
}

impl Forwarder {
    pub fn new(
        security: Arc<SecurityGate>,
        routes: Arc<RouteTable>,
        selector: Arc<EndpointSelector>,
        pools: PoolManager,
        service_header: HeaderName,
    ) -> Self {
        Self {
            security,
            routes,
            selector,
            pools,
            service_header,
            stats: RequestStats::default(),
            held: Mutex::new(Vec::new()),
        }
    }

    pub fn stats(&self) -> &RequestStats {
        &self.stats
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// Handle one inbound request. Failures become problem responses.
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Response<GatewayBody> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Ulid::new().to_string());

        let span = info_span!(
            "request",
            request_id = %request_id,
            method = %req.method(),
            path = %req.uri().path(),
            route = field::Empty,
            endpoint = field::Empty,
        );

        async {
            let mut in_flight = InFlight::new(&self.stats);
            let result = self.forward(req, peer, &request_id, &cancel).await;
            in_flight.answered();
            match result {
                Ok(response) => {
                    self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                    response
                }
                Err(err) => {
                    self.stats.record_failure(&err);
                    match &err {
                        GatewayError::BackendConnectionFailure { .. }
                        | GatewayError::BackendProtocolFailure { .. }
                        | GatewayError::PoolExhausted { .. }
                        | GatewayError::SecurityBackendUnavailable(_) => {
                            warn!(error = %err, code = err.code(), "Request failed")
                        }
                        _ => debug!(error = %err, code = err.code(), "Request rejected"),
                    }
                    err.to_response(&request_id)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn forward(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        // Authenticating
        let identity = self
            .security
            .authenticate(&RequestContext {
                headers: req.headers(),
                peer: Some(peer),
            })
            .await?;

        // Routing
        let key = RouteKey::from_request(req.headers(), req.uri(), self.service_header.as_str());
        let route = match self.routes.resolve(&key) {
            RoutingDecision::Matched { route } => route,
            RoutingDecision::NoRoute { reason } => {
                return Err(GatewayError::NoRouteMatched(reason))
            }
        };
        Span::current().record("route", route.id.as_str());

        // Forwarding
        let mut request = self.prepare(req, &identity, peer, request_id);
        let mut tried: Vec<Endpoint> = Vec::with_capacity(MAX_ATTEMPTS);
        let mut last_error: Option<GatewayError> = None;

        loop {
            let endpoint = match self.selector.select(&route.target, &tried) {
                Ok(endpoint) => endpoint,
                Err(err) => return Err(last_error.unwrap_or(err)),
            };
            Span::current().record("endpoint", field::display(&endpoint));

            match self.try_endpoint(&endpoint, request, cancel).await {
                Ok(response) => return Ok(response),
                Err(AttemptFailure {
                    error,
                    request: Some(returned),
                }) if error.is_retryable() && tried.len() + 1 < MAX_ATTEMPTS => {
                    warn!(endpoint = %endpoint, error = %error, "Retrying on another endpoint");
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    tried.push(endpoint);
                    request = returned;
                    last_error = Some(error);
                }
                Err(failure) => return Err(failure.error),
            }
        }
    }

    async fn try_endpoint(
        &self,
        endpoint: &Endpoint,
        mut request: Request<BackendBody>,
        cancel: &CancellationToken,
    ) -> Result<Response<GatewayBody>, AttemptFailure> {
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.pools.acquire(endpoint) => Some(result),
        };
        let mut conn = match acquired {
            None => return Err(AttemptFailure::new(GatewayError::Cancelled, None)),
            Some(Ok(conn)) => conn,
            Some(Err(error)) => return Err(AttemptFailure::new(error, Some(request))),
        };

        if !request.headers().contains_key(header::HOST) {
            if let Ok(host) = HeaderValue::from_str(&endpoint.authority()) {
                request.headers_mut().insert(header::HOST, host);
            }
        }

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = conn.send(request) => Some(result),
        };

        match sent {
            None => {
                conn.release(false);
                Err(AttemptFailure::new(GatewayError::Cancelled, None))
            }
            Some(Ok(response)) => {
                info!(
                    endpoint = %endpoint,
                    status = response.status().as_u16(),
                    reused = conn.is_reused(),
                    "Forwarded request"
                );
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                let body = ReleaseBody::new(body, conn).boxed_unsync();
                Ok(Response::from_parts(parts, body))
            }
            Some(Err(SendFailure::NotSent { request, reason })) => {
                conn.release(false);
                Err(AttemptFailure::new(
                    GatewayError::connection_failure(endpoint, reason),
                    Some(request),
                ))
            }
            Some(Err(SendFailure::Failed(err))) => {
                conn.release(false);
                let error = if err.is_incomplete_message() || err.is_closed() || err.is_canceled() {
                    GatewayError::connection_failure(endpoint, &err)
                } else {
                    GatewayError::protocol_failure(endpoint, &err)
                };
                Err(AttemptFailure::new(error, None))
            }
        }
    }

    /// Rewrite an inbound request for the backend hop.
    fn prepare(
        &self,
        req: Request<Incoming>,
        identity: &Identity,
        peer: SocketAddr,
        request_id: &str,
    ) -> Request<BackendBody> {
        let (mut parts, body) = req.into_parts();
        let headers = &mut parts.headers;

        strip_hop_by_hop(headers);

        let identity_header = self.security.identity_header();
        headers.remove(identity_header);
        if !identity.is_anonymous() {
            match HeaderValue::from_str(identity.principal()) {
                Ok(value) => {
                    headers.insert(identity_header.clone(), value);
                }
                Err(_) => warn!("Principal is not a valid header value; identity not forwarded"),
            }
        }

        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(REQUEST_ID_HEADER, value);
        }
        append_forwarded_for(headers, peer);

        // Backends always receive origin-form over HTTP/1.1.
        if let Some(path_and_query) = parts.uri.path_and_query().cloned() {
            parts.uri = Uri::from(path_and_query);
        }
        parts.version = Version::HTTP_11;

        Request::from_parts(parts, body.boxed_unsync())
    }
}

/// The routing stage of startup: begins watching every route target so the
/// first requests find warm snapshots, and holds those watches until stop so
/// idle release never drops a routed service. Targets that do not sync in
/// time are logged and served as they are.
#[async_trait]
impl Service for Forwarder {
    fn name(&self) -> &str {
        "routing"
    }

    async fn start(&self) -> anyhow::Result<()> {
        let targets = self.routes.targets();
        let held: Vec<SnapshotStream> = targets
            .iter()
            .map(|service| self.selector.discovery().subscribe(service))
            .collect();
        *self.held.lock().unwrap_or_else(|e| e.into_inner()) = held;

        let unsynced = self.selector.warm_up(&targets, WARM_UP_TIMEOUT).await;
        for service in &unsynced {
            warn!(service = %service, "Route target not in sync with the registry yet");
        }
        info!(
            routes = self.routes.len(),
            targets = targets.len(),
            unsynced = unsynced.len(),
            "Routing table ready"
        );
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: SocketAddr) {
    let peer_ip = peer.ip().to_string();
    let value = match headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) if !existing.trim().is_empty() => format!("{existing}, {peer_ip}"),
        _ => peer_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(FORWARDED_FOR_HEADER, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "keep-alive, x-trace-hop".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert("x-trace-hop", "1".parse().unwrap());
        headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
        headers.insert(header::AUTHORIZATION, "Bearer x".parse().unwrap());

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 2);
        assert!(headers.contains_key(header::CONTENT_TYPE));
        assert!(headers.contains_key(header::AUTHORIZATION));
    }

    #[test]
    fn test_forwarded_for_appends_peer() {
        let peer: SocketAddr = "10.1.2.3:5555".parse().unwrap();

        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, peer);
        assert_eq!(headers[FORWARDED_FOR_HEADER], "10.1.2.3");

        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR_HEADER, "192.0.2.1".parse().unwrap());
        append_forwarded_for(&mut headers, peer);
        assert_eq!(headers[FORWARDED_FOR_HEADER], "192.0.2.1, 10.1.2.3");
    }

    #[test]
    fn test_failure_counters() {
        let stats = RequestStats::default();
        stats.record_failure(&GatewayError::AuthenticationFailure("x".into()));
        stats.record_failure(&GatewayError::SecurityBackendUnavailable("x".into()));
        stats.record_failure(&GatewayError::NoRouteMatched("x".into()));
        stats.record_failure(&GatewayError::connection_failure("e", "refused"));
        stats.record_failure(&GatewayError::protocol_failure("e", "garbage"));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.rejected_auth, 1);
        assert_eq!(snapshot.auth_unavailable, 1);
        assert_eq!(snapshot.rejected_no_route, 1);
        assert_eq!(snapshot.backend_failed, 2);
        assert_eq!(snapshot.forwarded, 0);
    }

    #[test]
    fn test_dropped_handler_counts_as_cancelled() {
        let stats = RequestStats::default();
        drop(InFlight::new(&stats));
        let mut answered = InFlight::new(&stats);
        answered.answered();
        drop(answered);
        assert_eq!(stats.snapshot().cancelled, 1);
    }
}
