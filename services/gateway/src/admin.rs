//! Admin endpoints.
//!
//! - `GET /healthz`: the process is up
//! - `GET /readyz`: 200 once every component has started, 503 before that and
//!   from the moment shutdown begins
//! - `GET /stats`: listener, request, pool and discovery counters as JSON

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use crate::discovery::DiscoveryWatcher;
use crate::lifecycle::Service;
use crate::proxy::forward::{Forwarder, RequestStatsSnapshot};
use crate::proxy::listener::{Listener, ListenerStatsSnapshot};
use crate::proxy::pool::{PoolManager, PoolStats};

/// Discovery state of one watched service.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ServiceStats {
    pub service: String,
    pub version: u64,
    pub registry_index: u64,
    pub endpoints: Vec<String>,
    pub stale: bool,
}

/// Everything `/stats` reports.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub ready: bool,
    pub listeners: Vec<ListenerStatsSnapshot>,
    pub requests: RequestStatsSnapshot,
    pub pools: PoolStats,
    pub services: Vec<ServiceStats>,
}

/// Handles to the components whose counters are reported.
#[derive(Clone)]
pub struct StatsSource {
    pub discovery: DiscoveryWatcher,
    pub pools: PoolManager,
    pub forwarder: Arc<Forwarder>,
    pub listeners: Vec<Listener>,
}

impl StatsSource {
    pub fn collect(&self, ready: bool) -> GatewayStats {
        let services = self
            .discovery
            .watched_services()
            .iter()
            .filter_map(|service| self.discovery.peek(service))
            .map(|snapshot| ServiceStats {
                service: snapshot.service().to_string(),
                version: snapshot.version(),
                registry_index: snapshot.registry_index(),
                endpoints: snapshot.endpoints().iter().map(ToString::to_string).collect(),
                stale: snapshot.is_stale(),
            })
            .collect();

        GatewayStats {
            ready,
            listeners: self.listeners.iter().map(Listener::stats_snapshot).collect(),
            requests: self.forwarder.stats().snapshot(),
            pools: self.pools.stats(),
            services,
        }
    }
}

#[derive(Clone)]
struct AdminState {
    stats: StatsSource,
    ready: watch::Receiver<bool>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
struct StatusResponse {
    status: String,
    version: String,
}

fn status(status: &str) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn healthz() -> impl IntoResponse {
    status("ok")
}

async fn readyz(State(state): State<AdminState>) -> impl IntoResponse {
    if *state.ready.borrow() {
        (StatusCode::OK, status("ready"))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, status("not_ready"))
    }
}

async fn stats(State(state): State<AdminState>) -> impl IntoResponse {
    let ready = *state.ready.borrow();
    Json(state.stats.collect(ready))
}

fn router(state: AdminState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/stats", get(stats))
        .with_state(state)
}

struct AdminInner {
    bind_addr: SocketAddr,
    state: AdminState,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// The admin HTTP server.
#[derive(Clone)]
pub struct AdminServer {
    inner: Arc<AdminInner>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, stats: StatsSource, ready: watch::Receiver<bool>) -> Self {
        Self {
            inner: Arc::new(AdminInner {
                bind_addr,
                state: AdminState { stats, ready },
                local_addr: Mutex::new(None),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .inner
            .local_addr
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Service for AdminServer {
    fn name(&self) -> &str {
        "admin"
    }

    async fn start(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.inner.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        *self
            .inner
            .local_addr
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(local_addr);
        info!(addr = %local_addr, "Admin endpoint listening");

        let app = router(self.inner.state.clone());
        let shutdown = self.inner.shutdown.clone();
        self.inner.tasks.spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                error!(error = %e, "Admin server error");
            }
        });
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        Ok(())
    }
}
