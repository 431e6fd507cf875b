//! Gateway configuration.
//!
//! Settings come from a TOML file; command-line flags (or their
//! `SWITCHYARD_*` environment variables) override the file. Everything is
//! validated into typed settings before any component is built.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use http::HeaderName;
use serde::Deserialize;
use switchyard_registry::ServiceName;
use thiserror::Error;

use crate::discovery::{
    DiscoveryConfig, DEFAULT_DEBOUNCE, DEFAULT_IDLE_GRACE, DEFAULT_RETRY_BACKOFF,
    DEFAULT_WATCH_WAIT,
};
use crate::proxy::balancer::BalanceStrategy;
use crate::proxy::listener::{DEFAULT_DRAIN_TIMEOUT, DEFAULT_MAX_CONNECTIONS};
use crate::proxy::pool::{
    PoolConfig, DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_MAX_CONNECTIONS_PER_ENDPOINT, DEFAULT_UNHEALTHY_COOLDOWN,
};
use crate::proxy::router::{Route, DEFAULT_SERVICE_HEADER};
use crate::security::{SecurityConfig, SecurityMode, DEFAULT_IDENTITY_HEADER};

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Command line of the `gateway` binary.
#[derive(Debug, Default, Parser)]
#[command(name = "gateway", version, about = "Switchyard routing gateway")]
pub struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "SWITCHYARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Discovery registry base URL.
    #[arg(long, env = "SWITCHYARD_REGISTRY_URL")]
    pub registry_url: Option<String>,

    /// Listener address; repeat for several. Replaces the file's listeners.
    #[arg(long = "listen", env = "SWITCHYARD_LISTEN", value_delimiter = ',')]
    pub listen: Vec<SocketAddr>,

    /// Admin endpoint address.
    #[arg(long, env = "SWITCHYARD_ADMIN_ADDR")]
    pub admin_addr: Option<SocketAddr>,

    #[arg(long, env = "SWITCHYARD_SECURITY_MODE", value_enum)]
    pub security_mode: Option<SecurityMode>,

    #[arg(long, env = "SWITCHYARD_DRAIN_TIMEOUT_MS")]
    pub drain_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins.
    #[arg(long, env = "SWITCHYARD_LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no discovery registry configured (set discovery.registry_url or SWITCHYARD_REGISTRY_URL)")]
    MissingRegistry,
    #[error("no listeners configured")]
    NoListeners,
    #[error("listener {addr}: {message}")]
    InvalidListener { addr: SocketAddr, message: String },
    #[error("route {id}: {message}")]
    InvalidRoute { id: String, message: String },
    #[error("duplicate route id {0}")]
    DuplicateRoute(String),
    #[error("invalid header name {0:?}")]
    InvalidHeader(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    listeners: Vec<RawListener>,
    #[serde(default)]
    routes: Vec<RawRoute>,
    service_header: Option<String>,
    #[serde(default)]
    pool: RawPool,
    #[serde(default)]
    discovery: RawDiscovery,
    #[serde(default)]
    security: RawSecurity,
    #[serde(default)]
    balance: BalanceStrategy,
    backend_ca_file: Option<PathBuf>,
    admin_addr: Option<SocketAddr>,
    drain_timeout_ms: Option<u64>,
    log_level: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawListener {
    bind: SocketAddr,
    max_connections: Option<usize>,
    tls_cert: Option<PathBuf>,
    tls_key: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRoute {
    id: Option<String>,
    service: Option<String>,
    host: Option<String>,
    path_prefix: Option<String>,
    target: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPool {
    max_connections_per_endpoint: Option<usize>,
    connect_timeout_ms: Option<u64>,
    acquire_timeout_ms: Option<u64>,
    idle_timeout_ms: Option<u64>,
    unhealthy_cooldown_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDiscovery {
    registry_url: Option<String>,
    debounce_ms: Option<u64>,
    idle_grace_ms: Option<u64>,
    stale_ttl_ms: Option<u64>,
    wait_ms: Option<u64>,
    retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSecurity {
    #[serde(default)]
    mode: SecurityMode,
    token_file: Option<PathBuf>,
    principal: Option<String>,
    keytab: Option<PathBuf>,
    verify_url: Option<String>,
    identity_header: Option<String>,
}

/// One inbound listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSettings {
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
    /// Certificate chain and key, both PEM.
    pub tls: Option<(PathBuf, PathBuf)>,
}

impl ListenerSettings {
    pub fn plain(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            tls: None,
        }
    }
}

/// Validated gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listeners: Vec<ListenerSettings>,
    pub routes: Vec<Route>,
    pub service_header: HeaderName,
    pub registry_url: Option<String>,
    pub discovery: DiscoveryConfig,
    pub pool: PoolConfig,
    pub security: SecurityConfig,
    pub balance: BalanceStrategy,
    pub backend_ca_file: Option<PathBuf>,
    pub admin_addr: Option<SocketAddr>,
    pub drain_timeout: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let bind_addr = DEFAULT_LISTEN_ADDR
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));
        Self {
            listeners: vec![ListenerSettings::plain(bind_addr)],
            routes: Vec::new(),
            service_header: HeaderName::from_static(DEFAULT_SERVICE_HEADER),
            registry_url: None,
            discovery: DiscoveryConfig::default(),
            pool: PoolConfig::default(),
            security: SecurityConfig::default(),
            balance: BalanceStrategy::default(),
            backend_ca_file: None,
            admin_addr: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            log_level: "info".to_string(),
        }
    }
}

fn millis(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

fn non_zero_millis(
    value: Option<u64>,
    default: Duration,
    name: &'static str,
) -> Result<Duration, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::Zero(name)),
        other => Ok(millis(other, default)),
    }
}

fn non_zero(value: Option<usize>, default: usize, name: &'static str) -> Result<usize, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::Zero(name)),
        Some(v) => Ok(v),
        None => Ok(default),
    }
}

fn header_name(value: Option<String>, default: &'static str) -> Result<HeaderName, ConfigError> {
    match value {
        Some(v) => HeaderName::from_bytes(v.trim().as_bytes()).map_err(|_| ConfigError::InvalidHeader(v)),
        None => Ok(HeaderName::from_static(default)),
    }
}

impl RawRoute {
    fn into_route(self, index: usize) -> Result<Route, ConfigError> {
        let id = self.id.unwrap_or_else(|| format!("route-{index}"));
        let invalid = |message: String| ConfigError::InvalidRoute {
            id: id.clone(),
            message,
        };

        let target = ServiceName::new(&self.target).map_err(|e| invalid(e.to_string()))?;
        match (self.service, self.host, self.path_prefix) {
            (Some(service), None, None) if !service.trim().is_empty() => {
                Ok(Route::service(id, &service, target))
            }
            (None, Some(host), None) if !host.trim().is_empty() => Ok(Route::host(id, &host, target)),
            (None, None, Some(prefix)) => Ok(Route::path_prefix(id, &prefix, target)),
            (None, None, None) => Err(invalid(
                "one of service, host or path_prefix is required".to_string(),
            )),
            (Some(_), None, None) | (None, Some(_), None) => {
                Err(invalid("match value must not be empty".to_string()))
            }
            _ => Err(invalid(
                "only one of service, host or path_prefix may be set".to_string(),
            )),
        }
    }
}

impl Config {
    /// Load the configuration for `args`: the file (if any), then overrides.
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse a TOML document. Does not require a registry; see
    /// [`validate`](Self::validate).
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let mut listeners = Vec::with_capacity(raw.listeners.len());
        for listener in raw.listeners {
            let tls = match (listener.tls_cert, listener.tls_key) {
                (Some(cert), Some(key)) => Some((cert, key)),
                (None, None) => None,
                _ => {
                    return Err(ConfigError::InvalidListener {
                        addr: listener.bind,
                        message: "tls_cert and tls_key must be set together".to_string(),
                    })
                }
            };
            listeners.push(ListenerSettings {
                bind_addr: listener.bind,
                max_connections: non_zero(
                    listener.max_connections,
                    DEFAULT_MAX_CONNECTIONS,
                    "listeners.max_connections",
                )?,
                tls,
            });
        }
        if listeners.is_empty() {
            listeners = defaults.listeners;
        }

        let mut seen = HashSet::new();
        let mut routes = Vec::with_capacity(raw.routes.len());
        for (index, raw_route) in raw.routes.into_iter().enumerate() {
            let route = raw_route.into_route(index)?;
            if !seen.insert(route.id.clone()) {
                return Err(ConfigError::DuplicateRoute(route.id));
            }
            routes.push(route);
        }

        let pool = PoolConfig {
            max_connections_per_endpoint: non_zero(
                raw.pool.max_connections_per_endpoint,
                DEFAULT_MAX_CONNECTIONS_PER_ENDPOINT,
                "pool.max_connections_per_endpoint",
            )?,
            connect_timeout: millis(raw.pool.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT),
            acquire_timeout: millis(raw.pool.acquire_timeout_ms, DEFAULT_ACQUIRE_TIMEOUT),
            idle_timeout: millis(raw.pool.idle_timeout_ms, DEFAULT_IDLE_TIMEOUT),
            unhealthy_cooldown: millis(raw.pool.unhealthy_cooldown_ms, DEFAULT_UNHEALTHY_COOLDOWN),
        };

        let discovery = DiscoveryConfig {
            debounce: non_zero_millis(
                raw.discovery.debounce_ms,
                DEFAULT_DEBOUNCE,
                "discovery.debounce_ms",
            )?,
            idle_grace: non_zero_millis(
                raw.discovery.idle_grace_ms,
                DEFAULT_IDLE_GRACE,
                "discovery.idle_grace_ms",
            )?,
            stale_ttl: raw.discovery.stale_ttl_ms.map(Duration::from_millis),
            wait: non_zero_millis(raw.discovery.wait_ms, DEFAULT_WATCH_WAIT, "discovery.wait_ms")?,
            retry_backoff: millis(raw.discovery.retry_backoff_ms, DEFAULT_RETRY_BACKOFF),
        };

        let identity_header = header_name(raw.security.identity_header, DEFAULT_IDENTITY_HEADER)?;
        let security = SecurityConfig {
            mode: raw.security.mode,
            token_file: raw.security.token_file,
            principal: raw.security.principal,
            keytab: raw.security.keytab,
            verify_url: raw.security.verify_url,
            identity_header: identity_header.as_str().to_string(),
        };

        Ok(Self {
            listeners,
            routes,
            service_header: header_name(raw.service_header, DEFAULT_SERVICE_HEADER)?,
            registry_url: raw.discovery.registry_url.filter(|url| !url.trim().is_empty()),
            discovery,
            pool,
            security,
            balance: raw.balance,
            backend_ca_file: raw.backend_ca_file,
            admin_addr: raw.admin_addr,
            drain_timeout: millis(raw.drain_timeout_ms, DEFAULT_DRAIN_TIMEOUT),
            log_level: raw.log_level.unwrap_or(defaults.log_level),
        })
    }

    /// Apply command-line overrides.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(url) = args.registry_url.as_ref().filter(|url| !url.trim().is_empty()) {
            self.registry_url = Some(url.clone());
        }
        if !args.listen.is_empty() {
            self.listeners = args.listen.iter().copied().map(ListenerSettings::plain).collect();
        }
        if let Some(addr) = args.admin_addr {
            self.admin_addr = Some(addr);
        }
        if let Some(mode) = args.security_mode {
            self.security.mode = mode;
        }
        if let Some(ms) = args.drain_timeout_ms {
            self.drain_timeout = Duration::from_millis(ms);
        }
        if let Some(level) = &args.log_level {
            self.log_level = level.clone();
        }
    }

    /// Checks that need the fully merged configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry_url.is_none() {
            return Err(ConfigError::MissingRegistry);
        }
        if self.listeners.is_empty() {
            return Err(ConfigError::NoListeners);
        }
        Ok(())
    }
}
