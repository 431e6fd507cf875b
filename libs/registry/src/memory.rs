//! In-process registry.
//!
//! Serves static membership from configuration and acts as a synthetic
//! discovery feed in tests: instances can be registered, replaced and removed,
//! and the whole registry can be made unreachable to exercise degraded modes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::{Instance, Membership, Registry, RegistryError, ServiceName};

/// In-memory registry with blocking-query semantics.
pub struct MemoryRegistry {
    services: Mutex<HashMap<ServiceName, watch::Sender<Membership>>>,
    /// Registry-wide change index.
    index: AtomicU64,
    reachable: watch::Sender<bool>,
    watch_calls: AtomicU64,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (reachable, _) = watch::channel(true);
        Self {
            services: Mutex::new(HashMap::new()),
            index: AtomicU64::new(0),
            reachable,
            watch_calls: AtomicU64::new(0),
        }
    }

    fn sender(&self, service: &ServiceName) -> watch::Sender<Membership> {
        let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());
        services
            .entry(service.clone())
            .or_insert_with(|| watch::channel(Membership::default()).0)
            .clone()
    }

    fn modify(&self, service: &ServiceName, f: impl FnOnce(&mut Vec<Instance>)) -> u64 {
        let sender = self.sender(service);
        let mut new_index = 0;
        sender.send_modify(|membership| {
            f(&mut membership.instances);
            new_index = self.index.fetch_add(1, Ordering::SeqCst) + 1;
            membership.index = new_index;
        });
        new_index
    }

    /// Register (or replace, by id) one instance. Returns the new index.
    pub fn register(&self, service: &ServiceName, instance: Instance) -> u64 {
        self.modify(service, |instances| {
            match instances.iter_mut().find(|i| i.id == instance.id) {
                Some(existing) => *existing = instance,
                None => instances.push(instance),
            }
        })
    }

    /// Remove one instance by id. Returns the new index.
    pub fn deregister(&self, service: &ServiceName, instance_id: &str) -> u64 {
        self.modify(service, |instances| instances.retain(|i| i.id != instance_id))
    }

    /// Replace the whole membership in a single registry update.
    pub fn set_instances(&self, service: &ServiceName, instances: Vec<Instance>) -> u64 {
        self.modify(service, |current| *current = instances)
    }

    /// Current membership of a service.
    pub fn membership(&self, service: &ServiceName) -> Membership {
        self.sender(service).borrow().clone()
    }

    /// Simulate losing (or regaining) connectivity to the registry.
    ///
    /// Watches in progress fail immediately when connectivity is lost.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.send_replace(reachable);
    }

    /// Number of watch calls served so far.
    pub fn watch_calls(&self) -> u64 {
        self.watch_calls.load(Ordering::Relaxed)
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn watch(
        &self,
        service: &ServiceName,
        after_index: Option<u64>,
        wait: Duration,
    ) -> Result<Membership, RegistryError> {
        self.watch_calls.fetch_add(1, Ordering::Relaxed);

        let mut reachable = self.reachable.subscribe();
        if !*reachable.borrow_and_update() {
            return Err(RegistryError::Unreachable("registry offline".to_string()));
        }

        let mut rx = self.sender(service).subscribe();
        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);

        loop {
            {
                let membership = rx.borrow_and_update();
                if after_index.is_none_or(|after| membership.index > after) {
                    return Ok(membership.clone());
                }
            }

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(RegistryError::Unreachable("registry closed".to_string()));
                    }
                }
                _ = reachable.changed() => {
                    if !*reachable.borrow_and_update() {
                        return Err(RegistryError::Unreachable("registry offline".to_string()));
                    }
                }
                _ = &mut deadline => {
                    return Ok(rx.borrow().clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn svc(name: &str) -> ServiceName {
        ServiceName::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_initial_watch_returns_immediately() {
        let registry = MemoryRegistry::new();
        let service = svc("svc-a");
        registry.register(&service, Instance::new("i-1", "127.0.0.1", 8080));

        let membership = registry
            .watch(&service, None, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(membership.index, 1);
        assert_eq!(membership.instances.len(), 1);
    }

    #[tokio::test]
    async fn test_watch_blocks_until_change() {
        let registry = Arc::new(MemoryRegistry::new());
        let service = svc("svc-a");
        let index = registry.register(&service, Instance::new("i-1", "127.0.0.1", 8080));

        let watcher = {
            let registry = Arc::clone(&registry);
            let service = service.clone();
            tokio::spawn(async move { registry.watch(&service, Some(index), Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!watcher.is_finished());

        registry.set_instances(
            &service,
            vec![
                Instance::new("i-2", "127.0.0.1", 8081),
                Instance::new("i-3", "127.0.0.1", 8082),
            ],
        );

        let membership = watcher.await.unwrap().unwrap();
        assert_eq!(membership.index, index + 1);
        let ids: Vec<_> = membership.instances.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["i-2", "i-3"]);
    }

    #[tokio::test]
    async fn test_watch_times_out_with_same_index() {
        let registry = MemoryRegistry::new();
        let service = svc("svc-a");
        let index = registry.register(&service, Instance::new("i-1", "127.0.0.1", 8080));

        let membership = registry
            .watch(&service, Some(index), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(membership.index, index);
    }

    #[tokio::test]
    async fn test_unreachable_fails_pending_watch() {
        let registry = Arc::new(MemoryRegistry::new());
        let service = svc("svc-a");
        let index = registry.register(&service, Instance::new("i-1", "127.0.0.1", 8080));

        let watcher = {
            let registry = Arc::clone(&registry);
            let service = service.clone();
            tokio::spawn(async move { registry.watch(&service, Some(index), Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.set_reachable(false);

        let err = watcher.await.unwrap().unwrap_err();
        assert!(err.is_unreachable());

        let err = registry
            .watch(&service, None, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_unreachable());

        registry.set_reachable(true);
        assert!(registry.watch(&service, None, Duration::from_millis(10)).await.is_ok());
    }

    #[test]
    fn test_register_replaces_by_id_and_deregister_removes() {
        let registry = MemoryRegistry::new();
        let service = svc("svc-a");
        registry.register(&service, Instance::new("i-1", "127.0.0.1", 8080));
        registry.register(&service, Instance::new("i-1", "127.0.0.1", 9090));
        assert_eq!(registry.membership(&service).instances[0].port, 9090);

        let index = registry.deregister(&service, "i-1");
        let membership = registry.membership(&service);
        assert_eq!(membership.index, index);
        assert!(membership.is_empty());
    }
}
