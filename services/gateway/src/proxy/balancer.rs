//! Endpoint selection.
//!
//! Reads the current snapshot of a service and picks one endpoint with the
//! configured strategy, skipping endpoints the pool manager reports as
//! unhealthy and any the caller already tried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::future::join_all;

use rand::Rng;
use serde::{Deserialize, Serialize};
use switchyard_registry::ServiceName;
use tracing::debug;

use crate::discovery::{DiscoveryWatcher, Endpoint};
use crate::error::GatewayError;
use crate::proxy::pool::PoolManager;

/// Load-balancing strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStrategy {
    /// Per-service counter over the eligible endpoints.
    #[default]
    RoundRobin,
    Random,
    /// Fewest connections in use; ties go to the earlier endpoint.
    LeastConnections,
}

pub struct EndpointSelector {
    discovery: DiscoveryWatcher,
    pools: PoolManager,
    strategy: BalanceStrategy,
    counters: RwLock<HashMap<ServiceName, Arc<AtomicUsize>>>,
}

impl EndpointSelector {
    pub fn new(discovery: DiscoveryWatcher, pools: PoolManager, strategy: BalanceStrategy) -> Self {
        Self {
            discovery,
            pools,
            strategy,
            counters: RwLock::new(HashMap::new()),
        }
    }

    pub fn discovery(&self) -> &DiscoveryWatcher {
        &self.discovery
    }

    pub fn strategy(&self) -> BalanceStrategy {
        self.strategy
    }

    fn counter(&self, service: &ServiceName) -> Arc<AtomicUsize> {
        // Fast path: read lock
        if let Some(counter) = self
            .counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(service)
        {
            return Arc::clone(counter);
        }

        // Slow path: write lock
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            counters
                .entry(service.clone())
                .or_insert_with(|| Arc::new(AtomicUsize::new(0))),
        )
    }

    /// Pick an endpoint of `service` that is not in `exclude`.
    ///
    /// Fails with [`GatewayError::ServiceUnavailable`] when the snapshot is
    /// empty or every endpoint is excluded or unhealthy.
    pub fn select(&self, service: &ServiceName, exclude: &[Endpoint]) -> Result<Endpoint, GatewayError> {
        let snapshot = self.discovery.current_snapshot(service);
        let eligible: Vec<&Endpoint> = snapshot
            .endpoints()
            .iter()
            .filter(|e| !exclude.contains(e) && self.pools.is_eligible(e))
            .collect();

        if eligible.is_empty() {
            debug!(
                service = %service,
                version = snapshot.version(),
                endpoint_count = snapshot.endpoints().len(),
                excluded = exclude.len(),
                "No eligible endpoints"
            );
            return Err(GatewayError::ServiceUnavailable(service.clone()));
        }

        let chosen = match self.strategy {
            BalanceStrategy::RoundRobin => {
                let n = self.counter(service).fetch_add(1, Ordering::Relaxed);
                eligible[n % eligible.len()]
            }
            BalanceStrategy::Random => eligible[rand::rng().random_range(0..eligible.len())],
            BalanceStrategy::LeastConnections => eligible
                .iter()
                .copied()
                .min_by_key(|e| self.pools.in_use(e))
                .unwrap_or(eligible[0]),
        };
        Ok(chosen.clone())
    }

    /// Start watching `services` and wait up to `timeout` for their first
    /// registry sync. Returns the services that did not sync in time.
    pub async fn warm_up(&self, services: &[ServiceName], timeout: Duration) -> Vec<ServiceName> {
        let synced = join_all(
            services
                .iter()
                .map(|service| self.discovery.wait_synced(service, timeout)),
        )
        .await;

        services
            .iter()
            .zip(synced)
            .filter(|(_, synced)| !synced)
            .map(|(service, _)| service.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveryConfig;
    use crate::proxy::pool::PoolConfig;
    use switchyard_registry::{Instance, MemoryRegistry};

    fn svc(name: &str) -> ServiceName {
        ServiceName::new(name).unwrap()
    }

    async fn selector(
        strategy: BalanceStrategy,
        instances: Vec<Instance>,
    ) -> (EndpointSelector, ServiceName) {
        let registry = Arc::new(MemoryRegistry::new());
        let service = svc("svc-a");
        registry.set_instances(&service, instances);
        let discovery = DiscoveryWatcher::new(registry, DiscoveryConfig::default());
        assert!(discovery.wait_synced(&service, Duration::from_secs(2)).await);
        let pools = PoolManager::new(PoolConfig::default(), None);
        (EndpointSelector::new(discovery, pools, strategy), service)
    }

    fn two() -> Vec<Instance> {
        vec![
            Instance::new("a", "127.0.0.1", 9001),
            Instance::new("b", "127.0.0.1", 9002),
        ]
    }

    #[tokio::test]
    async fn test_round_robin_alternates() {
        let (selector, service) = selector(BalanceStrategy::RoundRobin, two()).await;
        let ports: Vec<u16> = (0..4)
            .map(|_| selector.select(&service, &[]).unwrap().port)
            .collect();
        assert_eq!(ports, vec![9001, 9002, 9001, 9002]);
    }

    #[tokio::test]
    async fn test_exclude_skips_tried_endpoint() {
        let (selector, service) = selector(BalanceStrategy::RoundRobin, two()).await;
        let first = Endpoint::new("127.0.0.1", 9001);
        for _ in 0..3 {
            assert_eq!(selector.select(&service, &[first.clone()]).unwrap().port, 9002);
        }

        let both = [first, Endpoint::new("127.0.0.1", 9002)];
        assert!(matches!(
            selector.select(&service, &both),
            Err(GatewayError::ServiceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_snapshot_is_unavailable() {
        let (selector, service) = selector(BalanceStrategy::RoundRobin, Vec::new()).await;
        assert!(matches!(
            selector.select(&service, &[]),
            Err(GatewayError::ServiceUnavailable(s)) if s == service
        ));
    }

    #[tokio::test]
    async fn test_random_and_least_connections_stay_in_set() {
        for strategy in [BalanceStrategy::Random, BalanceStrategy::LeastConnections] {
            let (selector, service) = selector(strategy, two()).await;
            for _ in 0..20 {
                let port = selector.select(&service, &[]).unwrap().port;
                assert!(port == 9001 || port == 9002);
            }
        }
    }

    #[tokio::test]
    async fn test_least_connections_ties_go_to_first() {
        let (selector, service) = selector(BalanceStrategy::LeastConnections, two()).await;
        assert_eq!(selector.select(&service, &[]).unwrap().port, 9001);
    }

    #[tokio::test]
    async fn test_warm_up_reports_unsynced_services() {
        let registry = Arc::new(MemoryRegistry::new());
        let service = svc("svc-a");
        registry.set_instances(&service, two());
        let discovery = DiscoveryWatcher::new(registry.clone(), DiscoveryConfig::default());
        let pools = PoolManager::new(PoolConfig::default(), None);
        let selector = EndpointSelector::new(discovery.clone(), pools, BalanceStrategy::RoundRobin);

        let unsynced = selector
            .warm_up(&[service.clone()], Duration::from_secs(2))
            .await;
        assert!(unsynced.is_empty());
        assert_eq!(discovery.current_snapshot(&service).endpoints().len(), 2);

        registry.set_reachable(false);
        let cold = svc("svc-cold");
        let unsynced = selector
            .warm_up(&[service, cold.clone()], Duration::from_millis(100))
            .await;
        assert_eq!(unsynced, vec![cold]);
    }

    #[test]
    fn test_strategy_deserializes_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            balance: BalanceStrategy,
        }
        let w: Wrapper = toml::from_str("balance = \"least_connections\"").unwrap();
        assert_eq!(w.balance, BalanceStrategy::LeastConnections);
        assert_eq!(BalanceStrategy::default(), BalanceStrategy::RoundRobin);
    }
}
