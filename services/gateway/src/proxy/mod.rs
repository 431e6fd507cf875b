//! HTTP/1.1 reverse proxy.
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Security Gate -> RouteTable -> EndpointSelector -> PoolManager -> Backend
//!                                            |               |
//!                                       RouteMatch     DiscoveryWatcher snapshot
//! ```

pub mod balancer;
pub mod body;
pub mod forward;
pub mod listener;
pub mod pool;
pub mod router;

pub use balancer::{BalanceStrategy, EndpointSelector};
pub use body::{BackendBody, GatewayBody, ReleaseBody};
pub use forward::{Forwarder, RequestStats, RequestStatsSnapshot};
pub use listener::{Listener, ListenerConfig, ListenerStats, ListenerStatsSnapshot};
pub use pool::{EndpointStats, PoolConfig, PoolManager, PoolStats, PooledConnection};
pub use router::{Route, RouteKey, RouteMatch, RouteTable, RoutingDecision};
