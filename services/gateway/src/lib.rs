//! Switchyard Gateway Library
//!
//! An HTTP/1.1 routing gateway. Callers connect to the gateway, are
//! authenticated, and have their requests routed by virtual-service header,
//! host or path prefix to one of the live endpoints of a backend service.
//! Endpoint sets come from a discovery registry and change while the gateway
//! runs.
//!
//! ## Architecture
//!
//! ```text
//! Gateway (Orchestrator)
//! ├── DiscoveryWatcher   (registry watches, service snapshots)
//! ├── PoolManager        (backend connections per endpoint)
//! ├── Forwarder          (security gate, route table, endpoint selection)
//! ├── EndpointSync       (retires pools of departed endpoints)
//! ├── AdminServer        (health, readiness, stats)
//! └── Listener(addr)     (inbound connections)
//! ```
//!
//! ## Modules
//!
//! - `discovery`: registry watches and immutable service snapshots
//! - `proxy`: routing, balancing, pooling, forwarding and listeners
//! - `security`: caller authentication
//! - `lifecycle`: ordered start and stop
//! - `gateway`: wiring and process lifecycle

pub mod admin;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod proxy;
pub mod security;
pub mod sync;
pub mod tls;

pub use config::{Args, Config, ConfigError};
pub use discovery::{DiscoveryConfig, DiscoveryWatcher, Endpoint, ServiceSnapshot};
pub use error::GatewayError;
pub use gateway::Gateway;
pub use lifecycle::{LifecycleError, Orchestrator, Service};
pub use proxy::{BalanceStrategy, Route, RouteKey, RouteTable, RoutingDecision};
pub use security::{Identity, SecurityGate, SecurityMode};
