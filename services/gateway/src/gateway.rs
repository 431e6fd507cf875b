//! Gateway assembly and process lifecycle.
//!
//! [`Gateway::init`] validates the configuration, creates the scoped working
//! directory, enables the security mode and wires every component. The
//! components are then driven by an [`Orchestrator`] in dependency order.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use switchyard_registry::{HttpRegistry, Registry};
use tempfile::TempDir;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::admin::{AdminServer, GatewayStats, StatsSource};
use crate::config::{Config, ConfigError};
use crate::discovery::DiscoveryWatcher;
use crate::lifecycle::{Orchestrator, Service};
use crate::proxy::balancer::EndpointSelector;
use crate::proxy::forward::Forwarder;
use crate::proxy::listener::{Listener, ListenerConfig, ListenerGroup};
use crate::proxy::pool::PoolManager;
use crate::proxy::router::RouteTable;
use crate::security::SecurityGate;
use crate::sync::EndpointSync;
use crate::tls;

const WORKDIR_PREFIX: &str = "switchyard-gateway-";

pub struct Gateway {
    discovery: DiscoveryWatcher,
    pools: PoolManager,
    forwarder: Arc<Forwarder>,
    listeners: ListenerGroup,
    admin: Option<AdminServer>,
    orchestrator: Orchestrator,
    stats: StatsSource,
    workdir: Mutex<Option<TempDir>>,
}

impl Gateway {
    /// Build a gateway that discovers endpoints through the configured HTTP
    /// registry.
    pub fn init(config: Config) -> Result<Self> {
        config.validate()?;
        let url = config
            .registry_url
            .as_deref()
            .ok_or(ConfigError::MissingRegistry)?;
        let registry = HttpRegistry::new(url).context("invalid discovery registry URL")?;
        Self::with_registry(config, Arc::new(registry))
    }

    /// Build a gateway on top of `registry`. The configured registry URL is
    /// not used.
    pub fn with_registry(config: Config, registry: Arc<dyn Registry>) -> Result<Self> {
        let workdir = tempfile::Builder::new()
            .prefix(WORKDIR_PREFIX)
            .tempdir()
            .context("failed to create working directory")?;

        let security = SecurityGate::from_config(&config.security, workdir.path())
            .with_context(|| format!("failed to enable {} security", config.security.mode))?;

        let backend_tls = config
            .backend_ca_file
            .as_deref()
            .map(tls::client_config)
            .transpose()
            .context("failed to load backend CA")?;

        let discovery = DiscoveryWatcher::new(registry, config.discovery.clone());
        let pools = PoolManager::new(config.pool.clone(), backend_tls);
        let routes = Arc::new(RouteTable::new(config.routes.clone()));
        let selector = Arc::new(EndpointSelector::new(
            discovery.clone(),
            pools.clone(),
            config.balance,
        ));
        let forwarder = Arc::new(Forwarder::new(
            Arc::new(security),
            routes,
            selector,
            pools.clone(),
            config.service_header.clone(),
        ));

        let mut listeners = Vec::with_capacity(config.listeners.len());
        for settings in &config.listeners {
            let mut listener_config = ListenerConfig::new(settings.bind_addr);
            listener_config.max_connections = settings.max_connections;
            listener_config.drain_timeout = config.drain_timeout;
            if let Some((cert, key)) = &settings.tls {
                listener_config.tls = Some(tls::server_config(cert, key).with_context(|| {
                    format!("failed to load TLS for listener {}", settings.bind_addr)
                })?);
            }
            listeners.push(Listener::new(listener_config, Arc::clone(&forwarder)));
        }
        let listeners = ListenerGroup::new(listeners);

        let stats = StatsSource {
            discovery: discovery.clone(),
            pools: pools.clone(),
            forwarder: Arc::clone(&forwarder),
            listeners: listeners.listeners().to_vec(),
        };

        let (ready_tx, ready_rx) = watch::channel(false);
        let admin = config
            .admin_addr
            .map(|addr| AdminServer::new(addr, stats.clone(), ready_rx));

        let mut services: Vec<Arc<dyn Service>> = vec![
            Arc::new(discovery.clone()),
            Arc::new(pools.clone()),
            Arc::clone(&forwarder) as Arc<dyn Service>,
            Arc::new(EndpointSync::new(discovery.clone(), pools.clone())),
        ];
        if let Some(admin) = &admin {
            services.push(Arc::new(admin.clone()));
        }
        services.push(Arc::new(listeners.clone()));
        let orchestrator = Orchestrator::with_readiness(services, ready_tx);

        info!(
            workdir = %workdir.path().display(),
            security = %config.security.mode,
            balance = ?config.balance,
            routes = config.routes.len(),
            listeners = listeners.len(),
            components = ?orchestrator.names(),
            "Gateway initialised"
        );

        Ok(Self {
            discovery,
            pools,
            forwarder,
            listeners,
            admin,
            orchestrator,
            stats,
            workdir: Mutex::new(Some(workdir)),
        })
    }

    /// Start every component; listeners open last.
    pub async fn start(&self) -> Result<()> {
        self.orchestrator.start().await?;
        info!(listen_addrs = ?self.listen_addrs(), "Gateway started");
        Ok(())
    }

    /// Stop accepting, drain in-flight requests, then tear everything down.
    pub async fn stop(&self) {
        info!("Gateway stopping");
        self.orchestrator.stop().await;
        info!("Gateway stopped");
    }

    /// Release what is left after [`stop`](Self::stop), including the
    /// working directory. Safe to call more than once.
    pub fn destroy(&self) {
        let workdir = self.workdir.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(workdir) = workdir {
            let path = workdir.path().to_path_buf();
            match workdir.close() {
                Ok(()) => info!(workdir = %path.display(), "Working directory removed"),
                Err(e) => warn!(workdir = %path.display(), error = %e, "Failed to remove working directory"),
            }
        }
    }

    /// Bound listener addresses, in configuration order.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.local_addrs()
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin.as_ref().and_then(AdminServer::local_addr)
    }

    pub fn workdir(&self) -> Option<PathBuf> {
        self.workdir
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
    }

    pub fn readiness(&self) -> watch::Receiver<bool> {
        self.orchestrator.readiness()
    }

    pub fn is_ready(&self) -> bool {
        self.orchestrator.is_ready()
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        self.forwarder.routes()
    }

    pub fn discovery(&self) -> &DiscoveryWatcher {
        &self.discovery
    }

    pub fn pools(&self) -> &PoolManager {
        &self.pools
    }

    pub fn stats(&self) -> GatewayStats {
        self.stats.collect(self.is_ready())
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.destroy();
    }
}
