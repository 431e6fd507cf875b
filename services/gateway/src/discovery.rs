//! Discovery watcher.
//!
//! Maintains a live, eventually-consistent view of the endpoints that
//! implement each watched service.
//!
//! - One watch task per service long-polls the [`Registry`] with the last
//!   index it saw.
//! - Changes are coalesced over a debounce window and published as a single
//!   immutable [`ServiceSnapshot`]; readers swap in the new snapshot atomically
//!   and never see a partial set.
//! - When the registry becomes unreachable the last known snapshot is
//!   republished as stale and kept until reconnection (or until `stale_ttl`,
//!   when configured).
//! - Watches nobody has read or subscribed to for `idle_grace` are released.
//! - A long-poll that returns early without a new index is followed by a
//!   `retry_backoff` pause before the next one.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::Serialize;
use switchyard_registry::{Instance, Registry, ServiceName};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::lifecycle::Service;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);
pub const DEFAULT_IDLE_GRACE: Duration = Duration::from_secs(300);
pub const DEFAULT_WATCH_WAIT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound for the reconnect backoff.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// A resolved address of one running backend instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Connect with TLS.
    pub secure: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secure: false,
        }
    }

    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme(), self.authority())
    }
}

impl From<&Instance> for Endpoint {
    fn from(instance: &Instance) -> Self {
        Self {
            host: instance.host.clone(),
            port: instance.port,
            secure: instance.secure,
        }
    }
}

/// Immutable, versioned endpoint set for one service.
#[derive(Debug, Clone)]
pub struct ServiceSnapshot {
    service: ServiceName,
    version: u64,
    registry_index: u64,
    endpoints: Vec<Endpoint>,
    stale: bool,
    observed_at: Instant,
}

impl ServiceSnapshot {
    /// The placeholder served before the first discovery event.
    pub fn empty(service: ServiceName) -> Self {
        Self {
            service,
            version: 0,
            registry_index: 0,
            endpoints: Vec::new(),
            stale: false,
            observed_at: Instant::now(),
        }
    }

    pub fn service(&self) -> &ServiceName {
        &self.service
    }

    /// Gateway-local version; strictly increasing per service, 0 before sync.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn registry_index(&self) -> u64 {
        self.registry_index
    }

    /// Endpoints in registry order, without duplicates.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.endpoints.contains(endpoint)
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Served from the last known state while the registry is unreachable.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn observed_at(&self) -> Instant {
        self.observed_at
    }
}

/// Stream of snapshots for one service; yields the current snapshot first.
pub type SnapshotStream = WatchStream<Arc<ServiceSnapshot>>;

/// Discovery watcher settings.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub debounce: Duration,
    pub idle_grace: Duration,
    /// How long a stale snapshot is served; `None` serves it indefinitely.
    pub stale_ttl: Option<Duration>,
    /// Server-side wait of each long-poll.
    pub wait: Duration,
    pub retry_backoff: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            idle_grace: DEFAULT_IDLE_GRACE,
            stale_ttl: None,
            wait: DEFAULT_WATCH_WAIT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

struct WatchEntry {
    current: ArcSwap<ServiceSnapshot>,
    tx: watch::Sender<Arc<ServiceSnapshot>>,
    /// Milliseconds since the watcher epoch of the last read.
    last_access: AtomicU64,
    cancel: CancellationToken,
    /// Watcher-wide change counter.
    changes: Arc<watch::Sender<u64>>,
}

impl WatchEntry {
    /// Publish a new snapshot. Only the entry's watch task calls this, so
    /// versions are assigned without contention.
    fn publish(
        &self,
        registry_index: u64,
        endpoints: Vec<Endpoint>,
        stale: bool,
    ) -> Arc<ServiceSnapshot> {
        let previous = self.current.load();
        let snapshot = Arc::new(ServiceSnapshot {
            service: previous.service.clone(),
            version: previous.version + 1,
            registry_index,
            endpoints,
            stale,
            observed_at: Instant::now(),
        });
        self.current.store(Arc::clone(&snapshot));
        self.tx.send_replace(Arc::clone(&snapshot));
        self.changes.send_modify(|generation| *generation += 1);
        debug!(
            version = snapshot.version,
            registry_index,
            endpoint_count = snapshot.endpoints.len(),
            stale,
            "Published service snapshot"
        );
        snapshot
    }
}

/// Endpoints of `instances` in registry order, first occurrence kept.
fn endpoints_of(instances: &[Instance]) -> Vec<Endpoint> {
    let mut endpoints: Vec<Endpoint> = Vec::with_capacity(instances.len());
    for instance in instances {
        let endpoint = Endpoint::from(instance);
        if !endpoints.contains(&endpoint) {
            endpoints.push(endpoint);
        }
    }
    endpoints
}

struct WatcherInner {
    registry: Arc<dyn Registry>,
    config: DiscoveryConfig,
    watches: ArcSwap<HashMap<ServiceName, Arc<WatchEntry>>>,
    /// Serializes inserts and removals of watch entries.
    write_lock: Mutex<()>,
    changes: Arc<watch::Sender<u64>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    epoch: Instant,
}

impl WatcherInner {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// Shared handle to the discovery watcher.
#[derive(Clone)]
pub struct DiscoveryWatcher {
    inner: Arc<WatcherInner>,
}

impl DiscoveryWatcher {
    pub fn new(registry: Arc<dyn Registry>, config: DiscoveryConfig) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                registry,
                config,
                watches: ArcSwap::from_pointee(HashMap::new()),
                write_lock: Mutex::new(()),
                changes: Arc::new(watch::channel(0).0),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                epoch: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.inner.config
    }

    /// Current snapshot of `service`; starts watching it if needed.
    ///
    /// Never blocks: before the first discovery event the snapshot is empty
    /// with version 0.
    pub fn current_snapshot(&self, service: &ServiceName) -> Arc<ServiceSnapshot> {
        self.entry(service).current.load_full()
    }

    /// Subscribe to snapshots of `service`; starts watching it if needed.
    pub fn subscribe(&self, service: &ServiceName) -> SnapshotStream {
        WatchStream::new(self.receiver(service))
    }

    /// Wait until `service` holds a snapshot that is in sync with the
    /// registry. Returns `false` if `timeout` elapses first.
    pub async fn wait_synced(&self, service: &ServiceName, timeout: Duration) -> bool {
        let mut rx = self.receiver(service);
        let synced = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| s.version > 0 && !s.stale)).await,
            Ok(Ok(_))
        );
        synced
    }

    /// Snapshot of `service` if it is watched. Unlike
    /// [`current_snapshot`](Self::current_snapshot) this neither starts a
    /// watch nor counts as a read for idle release.
    pub fn peek(&self, service: &ServiceName) -> Option<Arc<ServiceSnapshot>> {
        self.inner
            .watches
            .load()
            .get(service)
            .map(|entry| entry.current.load_full())
    }

    /// Counter bumped on every published snapshot and every released watch.
    /// Holding the receiver does not keep any watch alive.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    /// Services currently being watched.
    pub fn watched_services(&self) -> Vec<ServiceName> {
        let mut services: Vec<_> = self.inner.watches.load().keys().cloned().collect();
        services.sort();
        services
    }

    fn entry(&self, service: &ServiceName) -> Arc<WatchEntry> {
        let now = self.inner.now_ms();
        if let Some(entry) = self.inner.watches.load().get(service) {
            if !entry.cancel.is_cancelled() {
                entry.last_access.store(now, Ordering::Relaxed);
                return Arc::clone(entry);
            }
        }

        let _guard = self
            .inner
            .write_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        self.entry_locked(service, now)
    }

    /// Subscribe while holding the write lock, so the entry cannot be
    /// released between lookup and subscription.
    fn receiver(&self, service: &ServiceName) -> watch::Receiver<Arc<ServiceSnapshot>> {
        let now = self.inner.now_ms();
        let _guard = self
            .inner
            .write_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        self.entry_locked(service, now).tx.subscribe()
    }

    /// Live entry for `service`, created if missing. A cancelled entry is
    /// replaced unless the watcher itself is shutting down. Callers hold
    /// `write_lock`.
    fn entry_locked(&self, service: &ServiceName, now: u64) -> Arc<WatchEntry> {
        let current = self.inner.watches.load_full();
        if let Some(entry) = current.get(service) {
            if !entry.cancel.is_cancelled() || self.inner.shutdown.is_cancelled() {
                entry.last_access.store(now, Ordering::Relaxed);
                return Arc::clone(entry);
            }
            debug!(service = %service, "Replacing cancelled service watch");
        }

        let initial = Arc::new(ServiceSnapshot::empty(service.clone()));
        let (tx, _) = watch::channel(Arc::clone(&initial));
        let entry = Arc::new(WatchEntry {
            current: ArcSwap::new(initial),
            tx,
            last_access: AtomicU64::new(now),
            cancel: self.inner.shutdown.child_token(),
            changes: Arc::clone(&self.inner.changes),
        });

        let mut next = (*current).clone();
        next.insert(service.clone(), Arc::clone(&entry));
        self.inner.watches.store(Arc::new(next));

        info!(service = %service, "Watching service");
        self.inner.tasks.spawn(
            run_watch(Arc::clone(&self.inner), Arc::clone(&entry))
                .instrument(info_span!("discovery", service = %service)),
        );
        entry
    }

    /// Release watches with no subscribers that have not been read for
    /// `idle_grace`. Returns the released services.
    pub fn release_idle(&self) -> Vec<ServiceName> {
        let grace = self.inner.config.idle_grace.as_millis() as u64;
        let _guard = self
            .inner
            .write_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let now = self.inner.now_ms();
        let current = self.inner.watches.load_full();

        let idle: Vec<ServiceName> = current
            .iter()
            .filter(|(_, entry)| {
                entry.tx.receiver_count() == 0
                    && now.saturating_sub(entry.last_access.load(Ordering::Relaxed)) >= grace
            })
            .map(|(service, _)| service.clone())
            .collect();
        if idle.is_empty() {
            return idle;
        }

        let mut next = (*current).clone();
        for service in &idle {
            if let Some(entry) = next.remove(service) {
                entry.cancel.cancel();
                info!(service = %service, "Released idle service watch");
            }
        }
        self.inner.watches.store(Arc::new(next));
        self.inner.changes.send_modify(|generation| *generation += 1);
        idle
    }
}

async fn run_janitor(watcher: DiscoveryWatcher) {
    let period = (watcher.inner.config.idle_grace / 2).max(Duration::from_millis(10));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = watcher.inner.shutdown.cancelled() => break,
            _ = interval.tick() => {
                watcher.release_idle();
            }
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// A membership change waiting out the debounce window.
struct PendingUpdate {
    registry_index: u64,
    endpoints: Vec<Endpoint>,
    deadline: tokio::time::Instant,
}

/// Watch loop for one service.
async fn run_watch(inner: Arc<WatcherInner>, entry: Arc<WatchEntry>) {
    let config = &inner.config;
    let service = entry.current.load().service.clone();

    let mut index: Option<u64> = None;
    let mut pending: Option<PendingUpdate> = None;
    let mut disconnected_since: Option<Instant> = None;
    let mut backoff = config.retry_backoff;
    // Earliest start of the next long-poll.
    let mut not_before: Option<tokio::time::Instant> = None;

    loop {
        let deadline = pending.as_ref().map(|update| update.deadline);
        let poll = async {
            if let Some(at) = not_before {
                tokio::time::sleep_until(at).await;
            }
            let started = tokio::time::Instant::now();
            (started, inner.registry.watch(&service, index, config.wait).await)
        };
        let (started, result) = tokio::select! {
            biased;
            _ = entry.cancel.cancelled() => break,
            _ = sleep_until(deadline) => {
                if let Some(update) = pending.take() {
                    entry.publish(update.registry_index, update.endpoints, false);
                }
                continue;
            }
            polled = poll => polled,
        };
        not_before = None;

        match result {
            Ok(membership) => {
                backoff = config.retry_backoff;
                let resync = disconnected_since.take().is_some();
                let first = index.is_none();
                let advanced = index != Some(membership.index);
                index = Some(membership.index);
                let endpoints = endpoints_of(&membership.instances);

                if first || resync {
                    if resync {
                        info!(
                            registry_index = membership.index,
                            "Registry reachable again; resynchronised"
                        );
                    }
                    pending = None;
                    entry.publish(membership.index, endpoints, false);
                } else {
                    // Compare against the newest set known, published or not.
                    let differs = match &pending {
                        Some(update) => update.endpoints != endpoints,
                        None => entry.current.load().endpoints != endpoints,
                    };
                    if advanced || differs {
                        let deadline = pending
                            .take()
                            .map(|update| update.deadline)
                            .unwrap_or_else(|| tokio::time::Instant::now() + config.debounce);
                        pending = Some(PendingUpdate {
                            registry_index: membership.index,
                            endpoints,
                            deadline,
                        });
                    }
                }

                if !advanced && started.elapsed() < config.wait {
                    not_before = Some(tokio::time::Instant::now() + config.retry_backoff);
                }
            }
            Err(err) => {
                let now = Instant::now();
                let since = *disconnected_since.get_or_insert(now);

                if let Some(update) = pending.take() {
                    entry.publish(update.registry_index, update.endpoints, true);
                }

                let current = entry.current.load_full();
                let expired = config
                    .stale_ttl
                    .is_some_and(|ttl| now.duration_since(since) >= ttl);
                if expired {
                    if !current.is_empty() || !current.is_stale() {
                        warn!(error = %err, "Stale TTL elapsed; dropping endpoints");
                        entry.publish(current.registry_index, Vec::new(), true);
                    }
                } else if !current.is_stale() {
                    warn!(
                        error = %err,
                        endpoint_count = current.endpoints.len(),
                        "Registry unreachable; serving last known snapshot as stale"
                    );
                    entry.publish(current.registry_index, current.endpoints.clone(), true);
                } else {
                    debug!(error = %err, "Registry still unreachable");
                }

                // Wake up in time to enforce the TTL.
                let delay = match config.stale_ttl {
                    Some(ttl) if !expired => {
                        let remaining = ttl.saturating_sub(now.duration_since(since));
                        backoff.min(remaining.max(Duration::from_millis(1)))
                    }
                    _ => backoff,
                };
                tokio::select! {
                    _ = entry.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
            }
        }
    }

    debug!("Service watch stopped");
}

#[async_trait]
impl Service for DiscoveryWatcher {
    fn name(&self) -> &str {
        "discovery"
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.inner.tasks.spawn(run_janitor(self.clone()));
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        Ok(())
    }
}
