//! Outbound connection pools.
//!
//! One bounded pool of HTTP/1.1 client connections per endpoint:
//!
//! - A per-endpoint semaphore bounds connections in use; acquisition waits
//!   for a slot up to `acquire_timeout`
//! - Idle connections are reused most-recently-used first; a new connection
//!   is opened lazily only when none is idle
//! - A failed connect marks the endpoint unhealthy for `unhealthy_cooldown`
//! - Retiring an endpoint drains its pool: idle connections close at once,
//!   connections in use close when released, and the pool entry is removed
//!   once nothing is in use
//!
//! Pool state is guarded per endpoint; the pool map itself is only
//! write-locked to insert or remove an endpoint.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::{Request, Response};
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::discovery::Endpoint;
use crate::error::GatewayError;
use crate::lifecycle::Service;
use crate::proxy::body::BackendBody;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_UNHEALTHY_COOLDOWN: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_CONNECTIONS_PER_ENDPOINT: usize = 32;

pub type ConnectionId = Ulid;

/// Pool settings shared by every endpoint.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections_per_endpoint: usize,
    pub connect_timeout: Duration,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub unhealthy_cooldown: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_endpoint: DEFAULT_MAX_CONNECTIONS_PER_ENDPOINT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            unhealthy_cooldown: DEFAULT_UNHEALTHY_COOLDOWN,
        }
    }
}

struct IdleConnection {
    id: ConnectionId,
    sender: SendRequest<BackendBody>,
    idle_since: Instant,
}

#[derive(Default)]
struct PoolState {
    /// Oldest first.
    idle: Vec<IdleConnection>,
    /// Connections currently moved into a request.
    outstanding: HashSet<ConnectionId>,
    draining: bool,
    unhealthy_until: Option<Instant>,
}

#[derive(Default)]
struct EndpointCounters {
    opened: AtomicU64,
    closed: AtomicU64,
    reused: AtomicU64,
    requests: AtomicU64,
    connect_failures: AtomicU64,
}

/// Connections to a single endpoint.
struct EndpointPool {
    endpoint: Endpoint,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    counters: EndpointCounters,
    manager: Weak<PoolInner>,
}

impl EndpointPool {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_draining(&self) -> bool {
        self.lock_state().draining
    }

    /// Take the most recently used idle connection that is still usable.
    fn take_idle(&self, idle_timeout: Duration) -> Option<(ConnectionId, SendRequest<BackendBody>)> {
        let mut state = self.lock_state();
        while let Some(conn) = state.idle.pop() {
            if conn.sender.is_closed() || conn.idle_since.elapsed() >= idle_timeout {
                self.counters.closed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            state.outstanding.insert(conn.id);
            return Some((conn.id, conn.sender));
        }
        None
    }

    fn mark_unhealthy(&self, cooldown: Duration) {
        self.lock_state().unhealthy_until = Some(Instant::now() + cooldown);
    }

    fn is_healthy(&self) -> bool {
        self.lock_state()
            .unhealthy_until
            .is_none_or(|until| until <= Instant::now())
    }

    /// Return a connection to the pool. Ids not currently outstanding are
    /// ignored, so a connection is accounted for at most once.
    fn finish(&self, id: ConnectionId, sender: SendRequest<BackendBody>, healthy: bool) {
        let mut state = self.lock_state();
        if !state.outstanding.remove(&id) {
            debug!(endpoint = %self.endpoint, connection_id = %id, "Ignoring release of unknown connection");
            return;
        }

        if healthy && !state.draining && !sender.is_closed() {
            state.idle.push(IdleConnection {
                id,
                sender,
                idle_since: Instant::now(),
            });
        } else {
            drop(sender);
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
            debug!(
                endpoint = %self.endpoint,
                connection_id = %id,
                healthy,
                draining = state.draining,
                "Closed backend connection"
            );
        }

        let drained = state.draining && state.outstanding.is_empty();
        drop(state);
        if drained {
            if let Some(manager) = self.manager.upgrade() {
                manager.remove_if_same(&self.endpoint, self);
            }
        }
    }

    /// Close idle connections past `idle_timeout` or closed by the backend.
    fn reap(&self, idle_timeout: Duration) -> usize {
        let mut state = self.lock_state();
        let before = state.idle.len();
        state
            .idle
            .retain(|c| !c.sender.is_closed() && c.idle_since.elapsed() < idle_timeout);
        let reaped = before - state.idle.len();
        self.counters
            .closed
            .fetch_add(reaped as u64, Ordering::Relaxed);
        reaped
    }

    fn stats(&self) -> EndpointStats {
        let state = self.lock_state();
        EndpointStats {
            endpoint: self.endpoint.to_string(),
            idle: state.idle.len(),
            in_use: state.outstanding.len(),
            opened: self.counters.opened.load(Ordering::Relaxed),
            closed: self.counters.closed.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            requests: self.counters.requests.load(Ordering::Relaxed),
            connect_failures: self.counters.connect_failures.load(Ordering::Relaxed),
            draining: state.draining,
            healthy: state
                .unhealthy_until
                .is_none_or(|until| until <= Instant::now()),
        }
    }
}

/// Statistics for one endpoint pool.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub endpoint: String,
    pub idle: usize,
    pub in_use: usize,
    pub opened: u64,
    pub closed: u64,
    pub reused: u64,
    pub requests: u64,
    pub connect_failures: u64,
    pub draining: bool,
    pub healthy: bool,
}

/// Statistics across all pools.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Acquisition attempts, including rejected ones.
    pub acquisitions: u64,
    pub connect_attempts: u64,
    pub endpoints: Vec<EndpointStats>,
}

impl PoolStats {
    pub fn endpoint(&self, endpoint: &Endpoint) -> Option<&EndpointStats> {
        let key = endpoint.to_string();
        self.endpoints.iter().find(|s| s.endpoint == key)
    }
}

struct PoolInner {
    config: PoolConfig,
    tls: Option<Arc<rustls::ClientConfig>>,
    pools: RwLock<HashMap<Endpoint, Arc<EndpointPool>>>,
    acquisitions: AtomicU64,
    connect_attempts: AtomicU64,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl PoolInner {
    fn get(&self, endpoint: &Endpoint) -> Option<Arc<EndpointPool>> {
        self.pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(endpoint)
            .cloned()
    }

    fn all(&self) -> Vec<Arc<EndpointPool>> {
        self.pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Get or create the live pool for `endpoint`. A draining pool is
    /// replaced; its connections still in use finish against the old entry.
    fn pool_for(self: &Arc<Self>, endpoint: &Endpoint) -> Arc<EndpointPool> {
        // Fast path: read lock
        if let Some(pool) = self.get(endpoint) {
            if !pool.is_draining() {
                return pool;
            }
        }

        // Slow path: write lock
        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        if let Some(pool) = pools.get(endpoint) {
            if !pool.is_draining() {
                return Arc::clone(pool);
            }
        }
        let pool = Arc::new(EndpointPool {
            endpoint: endpoint.clone(),
            permits: Arc::new(Semaphore::new(self.config.max_connections_per_endpoint)),
            state: Mutex::new(PoolState::default()),
            counters: EndpointCounters::default(),
            manager: Arc::downgrade(self),
        });
        pools.insert(endpoint.clone(), Arc::clone(&pool));
        debug!(endpoint = %endpoint, "Created endpoint pool");
        pool
    }

    fn remove_if_same(&self, endpoint: &Endpoint, pool: &EndpointPool) {
        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        if pools
            .get(endpoint)
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), pool))
        {
            pools.remove(endpoint);
            info!(endpoint = %endpoint, "Removed drained endpoint pool");
        }
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<SendRequest<BackendBody>, GatewayError> {
        let connect_timeout = self.config.connect_timeout;
        debug!(endpoint = %endpoint, "Connecting to backend");

        let stream = match timeout(connect_timeout, TcpStream::connect(endpoint.authority())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(GatewayError::connection_failure(endpoint, e)),
            Err(_) => return Err(GatewayError::connection_failure(endpoint, "connect timeout")),
        };
        let _ = stream.set_nodelay(true);

        if !endpoint.secure {
            return handshake(endpoint, TokioIo::new(stream)).await;
        }

        let Some(tls) = &self.tls else {
            return Err(GatewayError::connection_failure(
                endpoint,
                "no backend CA configured for TLS endpoint",
            ));
        };
        let server_name = ServerName::try_from(endpoint.host.as_str())
            .map_err(|e| GatewayError::connection_failure(endpoint, e))?
            .to_owned();
        let connector = TlsConnector::from(Arc::clone(tls));
        let stream = match timeout(connect_timeout, connector.connect(server_name, stream)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(GatewayError::connection_failure(endpoint, e)),
            Err(_) => {
                return Err(GatewayError::connection_failure(endpoint, "TLS handshake timeout"))
            }
        };
        handshake(endpoint, TokioIo::new(stream)).await
    }
}

async fn handshake<T>(endpoint: &Endpoint, io: T) -> Result<SendRequest<BackendBody>, GatewayError>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(io)
        .await
        .map_err(|e| GatewayError::connection_failure(endpoint, e))?;
    let endpoint = endpoint.clone();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(endpoint = %endpoint, error = %e, "Backend connection ended with error");
        }
    });
    Ok(sender)
}

/// A send attempt that did not produce a response.
#[derive(Debug)]
pub enum SendFailure {
    /// The request never reached the backend and is handed back intact.
    NotSent {
        request: Request<BackendBody>,
        reason: String,
    },
    /// The connection failed after the request was (at least partly) written.
    Failed(hyper::Error),
}

/// One backend connection moved into a single request.
///
/// Dropping it without [`release`](Self::release) closes the connection.
pub struct PooledConnection {
    id: ConnectionId,
    sender: Option<SendRequest<BackendBody>>,
    pool: Arc<EndpointPool>,
    reused: bool,
    // Dropped after `Drop::drop` has returned the connection to the pool.
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.pool.endpoint
    }

    /// Whether this connection was taken from the idle list.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Send one request over this connection.
    pub async fn send(
        &mut self,
        request: Request<BackendBody>,
    ) -> Result<Response<Incoming>, SendFailure> {
        let Some(sender) = self.sender.as_mut() else {
            return Err(SendFailure::NotSent {
                request,
                reason: "connection already released".to_string(),
            });
        };
        if let Err(e) = sender.ready().await {
            return Err(SendFailure::NotSent {
                request,
                reason: e.to_string(),
            });
        }

        self.pool.counters.requests.fetch_add(1, Ordering::Relaxed);
        match sender.try_send_request(request).await {
            Ok(response) => Ok(response),
            Err(mut err) => match err.take_message() {
                Some(request) => Err(SendFailure::NotSent {
                    request,
                    reason: err.error().to_string(),
                }),
                None => Err(SendFailure::Failed(err.into_error())),
            },
        }
    }

    /// Hand the connection back. Healthy connections are kept for reuse
    /// unless the endpoint is draining or the backend closed them.
    pub fn release(mut self, healthy: bool) {
        self.finish(healthy);
    }

    fn finish(&mut self, healthy: bool) {
        if let Some(sender) = self.sender.take() {
            self.pool.finish(self.id, sender, healthy);
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.finish(false);
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("endpoint", &self.pool.endpoint)
            .field("reused", &self.reused)
            .finish()
    }
}

/// Shared handle to all endpoint pools.
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<PoolInner>,
}

impl PoolManager {
    pub fn new(config: PoolConfig, tls: Option<Arc<rustls::ClientConfig>>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                tls,
                pools: RwLock::new(HashMap::new()),
                acquisitions: AtomicU64::new(0),
                connect_attempts: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquire a connection to `endpoint`.
    ///
    /// Waits up to `acquire_timeout` for a free slot ([`GatewayError::PoolExhausted`]),
    /// then reuses an idle connection or connects within `connect_timeout`
    /// ([`GatewayError::BackendConnectionFailure`]).
    pub async fn acquire(&self, endpoint: &Endpoint) -> Result<PooledConnection, GatewayError> {
        self.inner.acquisitions.fetch_add(1, Ordering::Relaxed);
        if self.inner.shutdown.is_cancelled() {
            return Err(GatewayError::connection_failure(
                endpoint,
                "connection pools shut down",
            ));
        }

        let pool = self.inner.pool_for(endpoint);
        let permit = match timeout(
            self.inner.config.acquire_timeout,
            Arc::clone(&pool.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(GatewayError::connection_failure(endpoint, "endpoint retired"))
            }
            Err(_) => {
                warn!(endpoint = %endpoint, "Connection pool exhausted");
                return Err(GatewayError::PoolExhausted {
                    endpoint: endpoint.to_string(),
                });
            }
        };

        if let Some((id, sender)) = pool.take_idle(self.inner.config.idle_timeout) {
            pool.counters.reused.fetch_add(1, Ordering::Relaxed);
            debug!(endpoint = %endpoint, connection_id = %id, "Reusing pooled connection");
            return Ok(PooledConnection {
                id,
                sender: Some(sender),
                pool,
                reused: true,
                _permit: permit,
            });
        }

        self.inner.connect_attempts.fetch_add(1, Ordering::Relaxed);
        match self.inner.connect(endpoint).await {
            Ok(sender) => {
                let id = Ulid::new();
                {
                    let mut state = pool.lock_state();
                    state.outstanding.insert(id);
                    state.unhealthy_until = None;
                }
                pool.counters.opened.fetch_add(1, Ordering::Relaxed);
                debug!(endpoint = %endpoint, connection_id = %id, "Opened backend connection");
                Ok(PooledConnection {
                    id,
                    sender: Some(sender),
                    pool,
                    reused: false,
                    _permit: permit,
                })
            }
            Err(err) => {
                pool.counters
                    .connect_failures
                    .fetch_add(1, Ordering::Relaxed);
                pool.mark_unhealthy(self.inner.config.unhealthy_cooldown);
                warn!(endpoint = %endpoint, error = %err, "Backend connection failed");
                Err(err)
            }
        }
    }

    /// Whether `endpoint` may be selected: not inside an unhealthy cooldown.
    pub fn is_eligible(&self, endpoint: &Endpoint) -> bool {
        self.inner
            .get(endpoint)
            .is_none_or(|pool| pool.is_healthy())
    }

    /// Connections to `endpoint` currently in use.
    pub fn in_use(&self, endpoint: &Endpoint) -> usize {
        self.inner
            .get(endpoint)
            .map_or(0, |pool| pool.lock_state().outstanding.len())
    }

    /// Endpoints with a pool entry.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<_> = self.inner.all().iter().map(|p| p.endpoint.clone()).collect();
        endpoints.sort();
        endpoints
    }

    /// Drain the pool of an endpoint that left discovery.
    pub fn retire(&self, endpoint: &Endpoint) {
        let Some(pool) = self.inner.get(endpoint) else {
            return;
        };

        let (closed, in_flight) = {
            let mut state = pool.lock_state();
            state.draining = true;
            let closed = state.idle.len();
            state.idle.clear();
            (closed, state.outstanding.len())
        };
        pool.counters
            .closed
            .fetch_add(closed as u64, Ordering::Relaxed);
        pool.permits.close();
        info!(endpoint = %endpoint, idle_closed = closed, in_flight, "Retiring endpoint pool");

        if in_flight == 0 {
            self.inner.remove_if_same(endpoint, &pool);
        }
    }

    /// Close idle connections past the idle timeout. Returns how many closed.
    pub fn reap_idle(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout;
        self.inner
            .all()
            .iter()
            .map(|pool| pool.reap(idle_timeout))
            .sum()
    }

    pub fn stats(&self) -> PoolStats {
        let mut endpoints: Vec<_> = self.inner.all().iter().map(|p| p.stats()).collect();
        endpoints.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        PoolStats {
            acquisitions: self.inner.acquisitions.load(Ordering::Relaxed),
            connect_attempts: self.inner.connect_attempts.load(Ordering::Relaxed),
            endpoints,
        }
    }
}

async fn run_reaper(pools: PoolManager) {
    let period = (pools.inner.config.idle_timeout / 2)
        .clamp(Duration::from_millis(10), Duration::from_secs(30));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = pools.inner.shutdown.cancelled() => break,
            _ = interval.tick() => {
                let reaped = pools.reap_idle();
                if reaped > 0 {
                    debug!(reaped, "Closed idle backend connections");
                }
            }
        }
    }
}

#[async_trait]
impl Service for PoolManager {
    fn name(&self) -> &str {
        "pools"
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.inner.tasks.spawn(run_reaper(self.clone()));
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.inner.shutdown.cancel();
        for endpoint in self.endpoints() {
            self.retire(&endpoint);
        }
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        Ok(())
    }
}
