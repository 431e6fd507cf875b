//! Inbound listener and connection handling.
//!
//! Each listener accepts TCP connections, optionally terminates TLS, and
//! serves HTTP/1.1 with keep-alive, handing every request to the shared
//! [`Forwarder`].
//!
//! Stopping a listener closes the socket first so new connections are
//! refused, then lets in-flight requests finish for up to `drain_timeout`.
//! Requests still running after that are cancelled. A [`ListenerGroup`]
//! closes every socket before any listener starts draining.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::future::join_all;
use hyper::rt::{Read, Write};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

use crate::lifecycle::Service;
use crate::proxy::forward::Forwarder;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default bound on waiting for in-flight requests at stop.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
/// How long an aborted connection may take to flush its final response.
const ABORT_GRACE: Duration = Duration::from_millis(500);

/// Configuration for a listener.
#[derive(Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// TLS termination; plain HTTP when `None`.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub drain_timeout: Duration,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            tls: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("max_connections", &self.max_connections)
            .field("tls", &self.tls.is_some())
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently open.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// TLS handshakes that failed.
    pub tls_handshake_failed: AtomicU64,
}

/// Point-in-time copy of [`ListenerStats`].
#[derive(Debug, Clone, Serialize)]
pub struct ListenerStatsSnapshot {
    pub bind_addr: String,
    pub tls: bool,
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_closed: u64,
    pub connections_rejected: u64,
    pub tls_handshake_failed: u64,
}

struct ListenerInner {
    name: String,
    config: ListenerConfig,
    forwarder: Arc<Forwarder>,
    conn_semaphore: Arc<Semaphore>,
    stats: ListenerStats,
    local_addr: Mutex<Option<SocketAddr>>,
    /// Stops the accept loop.
    accepting: CancellationToken,
    /// Asks open connections to finish their current request and close.
    draining: CancellationToken,
    /// Parent of every connection token; cancels in-flight requests.
    aborting: CancellationToken,
    accept_task: TaskTracker,
    connections: TaskTracker,
}

/// An HTTP listener. Bound when started.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    pub fn new(config: ListenerConfig, forwarder: Arc<Forwarder>) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                name: format!("listener {}", config.bind_addr),
                conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
                config,
                forwarder,
                stats: ListenerStats::default(),
                local_addr: Mutex::new(None),
                accepting: CancellationToken::new(),
                draining: CancellationToken::new(),
                aborting: CancellationToken::new(),
                accept_task: TaskTracker::new(),
                connections: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.inner.config
    }

    /// Bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .inner
            .local_addr
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.inner.stats
    }

    pub fn stats_snapshot(&self) -> ListenerStatsSnapshot {
        let stats = &self.inner.stats;
        ListenerStatsSnapshot {
            bind_addr: self
                .local_addr()
                .unwrap_or(self.inner.config.bind_addr)
                .to_string(),
            tls: self.inner.config.tls.is_some(),
            connections_accepted: stats.connections_accepted.load(Ordering::Relaxed),
            connections_active: stats.connections_active.load(Ordering::Relaxed),
            connections_closed: stats.connections_closed.load(Ordering::Relaxed),
            connections_rejected: stats.connections_rejected.load(Ordering::Relaxed),
            tls_handshake_failed: stats.tls_handshake_failed.load(Ordering::Relaxed),
        }
    }

    /// Bind the socket and spawn the accept loop.
    pub async fn bind(&self) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(self.inner.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        *self
            .inner
            .local_addr
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(local_addr);

        info!(
            bind_addr = %local_addr,
            max_connections = self.inner.config.max_connections,
            tls = self.inner.config.tls.is_some(),
            "Listener bound"
        );
        self.inner.accept_task.spawn(self.clone().run(listener));
        Ok(local_addr)
    }

    /// Accept connections until stopped. The socket closes on return.
    async fn run(self, listener: TcpListener) {
        loop {
            let (stream, peer_addr) = tokio::select! {
                biased;
                _ = self.inner.accepting.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        // Brief sleep to avoid tight loop on persistent errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            // Try to acquire a permit
            let permit = match Arc::clone(&self.inner.conn_semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.inner
                        .stats
                        .connections_rejected
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                    continue;
                }
            };

            let stats = &self.inner.stats;
            stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
            stats.connections_active.fetch_add(1, Ordering::Relaxed);

            let listener = self.clone();
            self.inner.connections.spawn(
                async move {
                    if let Err(e) = listener.handle_connection(stream, peer_addr).await {
                        debug!(peer_addr = %peer_addr, error = %e, "Connection error");
                    }

                    let stats = &listener.inner.stats;
                    stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                    stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                    drop(permit);
                }
                .instrument(tracing::info_span!("connection", peer = %peer_addr)),
            );
        }

        info!(bind_addr = ?self.local_addr(), "Listener stopped accepting");
    }

    /// Handle a single connection.
    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> io::Result<()> {
        stream.set_nodelay(true)?;

        // Cancelled when this connection ends, for whatever reason.
        let cancel = self.inner.aborting.child_token();
        let _guard = cancel.clone().drop_guard();

        match &self.inner.config.tls {
            Some(tls) => {
                let acceptor = TlsAcceptor::from(Arc::clone(tls));
                let tls_stream = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    accepted = acceptor.accept(stream) => match accepted {
                        Ok(tls_stream) => tls_stream,
                        Err(e) => {
                            self.inner
                                .stats
                                .tls_handshake_failed
                                .fetch_add(1, Ordering::Relaxed);
                            debug!(error = %e, "TLS handshake failed");
                            return Ok(());
                        }
                    },
                };
                self.serve(TokioIo::new(tls_stream), peer_addr, cancel).await
            }
            None => self.serve(TokioIo::new(stream), peer_addr, cancel).await,
        }
    }

    async fn serve<I>(&self, io: I, peer_addr: SocketAddr, cancel: CancellationToken) -> io::Result<()>
    where
        I: Read + Write + Unpin + Send + 'static,
    {
        let forwarder = Arc::clone(&self.inner.forwarder);
        let service = service_fn(move |req| {
            let forwarder = Arc::clone(&forwarder);
            let cancel = cancel.child_token();
            async move {
                // Fires if hyper drops the request, i.e. the caller went away.
                let _guard = cancel.clone().drop_guard();
                Ok::<_, Infallible>(forwarder.handle(req, peer_addr, cancel).await)
            }
        });

        let conn = http1::Builder::new()
            .keep_alive(true)
            .serve_connection(io, service);
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = self.inner.draining.cancelled() => {
                conn.as_mut().graceful_shutdown();
                tokio::select! {
                    result = conn.as_mut() => result,
                    _ = self.inner.aborting.cancelled() => {
                        // Cancelled handlers still get to write their 503.
                        tokio::time::timeout(ABORT_GRACE, conn.as_mut())
                            .await
                            .unwrap_or(Ok(()))
                    }
                }
            }
        };

        result.map_err(io::Error::other)
    }

    /// Stop accepting, then drain open connections.
    pub async fn shutdown(&self) {
        self.stop_accepting().await;
        self.drain().await;
    }

    /// Close the socket. Returns once the accept loop has exited.
    pub async fn stop_accepting(&self) {
        let inner = &self.inner;
        inner.accepting.cancel();
        inner.accept_task.close();
        inner.accept_task.wait().await;
    }

    /// Let open connections finish for up to `drain_timeout`, then cancel
    /// whatever is still running.
    pub async fn drain(&self) {
        let inner = &self.inner;
        inner.draining.cancel();
        inner.connections.close();
        let drain_timeout = inner.config.drain_timeout;
        if tokio::time::timeout(drain_timeout, inner.connections.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = inner.connections.len(),
                drain_timeout_ms = drain_timeout.as_millis() as u64,
                "Drain timeout elapsed; cancelling in-flight requests"
            );
            inner.aborting.cancel();
            inner.connections.wait().await;
        }
        info!(bind_addr = ?self.local_addr(), "Listener drained");
    }
}

/// All inbound listeners, managed as one lifecycle component.
#[derive(Clone, Default)]
pub struct ListenerGroup {
    listeners: Vec<Listener>,
}

impl ListenerGroup {
    pub fn new(listeners: Vec<Listener>) -> Self {
        Self { listeners }
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Bound addresses, in configuration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().filter_map(Listener::local_addr).collect()
    }

    /// Close every socket, then drain every listener concurrently.
    pub async fn shutdown(&self) {
        join_all(self.listeners.iter().map(Listener::stop_accepting)).await;
        info!(listeners = self.listeners.len(), "All listeners closed");
        join_all(self.listeners.iter().map(Listener::drain)).await;
    }
}

#[async_trait]
impl Service for ListenerGroup {
    fn name(&self) -> &str {
        "listeners"
    }

    async fn start(&self) -> anyhow::Result<()> {
        for listener in &self.listeners {
            let bound = listener
                .bind()
                .await
                .with_context(|| format!("failed to bind {}", listener.inner.name));
            if let Err(e) = bound {
                self.shutdown().await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.shutdown().await;
        Ok(())
    }
}
