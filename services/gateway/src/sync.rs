//! Endpoint retirement sync.
//!
//! Follows discovery changes and retires the pool of every endpoint that no
//! watched service lists any more. Retired pools close idle connections at
//! once and let in-flight requests finish on theirs.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::discovery::{DiscoveryWatcher, Endpoint};
use crate::lifecycle::Service;
use crate::proxy::pool::PoolManager;

struct SyncInner {
    discovery: DiscoveryWatcher,
    pools: PoolManager,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

#[derive(Clone)]
pub struct EndpointSync {
    inner: Arc<SyncInner>,
}

impl EndpointSync {
    pub fn new(discovery: DiscoveryWatcher, pools: PoolManager) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                discovery,
                pools,
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Retire pools of endpoints absent from every watched snapshot.
    /// Returns the retired endpoints.
    pub fn reconcile(&self) -> Vec<Endpoint> {
        let discovery = &self.inner.discovery;
        let live: HashSet<Endpoint> = discovery
            .watched_services()
            .iter()
            .filter_map(|service| discovery.peek(service))
            .flat_map(|snapshot| snapshot.endpoints().to_vec())
            .collect();

        let retired: Vec<Endpoint> = self
            .inner
            .pools
            .endpoints()
            .into_iter()
            .filter(|endpoint| !live.contains(endpoint))
            .collect();
        for endpoint in &retired {
            info!(endpoint = %endpoint, "Endpoint left discovery; retiring pool");
            self.inner.pools.retire(endpoint);
        }
        retired
    }

    async fn run(self) {
        let mut changes = self.inner.discovery.changes();
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let retired = self.reconcile();
                    debug!(retired = retired.len(), "Endpoint sync pass complete");
                }
            }
        }
    }
}

#[async_trait]
impl Service for EndpointSync {
    fn name(&self) -> &str {
        "endpoint-sync"
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.inner.tasks.spawn(self.clone().run());
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        Ok(())
    }
}
