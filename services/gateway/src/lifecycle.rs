//! Ordered component lifecycle.
//!
//! Components are started in the order they are registered and stopped in
//! reverse. A component that fails to start aborts the chain: everything
//! started before it is stopped again, newest first, and the failure is
//! returned as a [`LifecycleError::StartupFailure`].
//!
//! ```text
//! start:  discovery -> pools -> routing -> endpoint-sync -> admin -> listeners
//! stop:   listeners (drain) -> admin -> endpoint-sync -> routing -> pools -> discovery
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

/// A component with an explicit start/stop lifecycle.
#[async_trait]
pub trait Service: Send + Sync {
    /// Component name for logging.
    fn name(&self) -> &str;

    /// Bring the component up. Returning `Ok` means the component is ready.
    async fn start(&self) -> anyhow::Result<()>;

    /// Tear the component down. Called at most once per successful start.
    async fn stop(&self) -> anyhow::Result<()>;
}

/// Errors raised by the orchestrator.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// A component failed to start; already-started components were stopped.
    #[error("failed to start {component}")]
    StartupFailure {
        component: String,
        #[source]
        source: anyhow::Error,
    },

    /// `start` was called while components are already running.
    #[error("components already started")]
    AlreadyStarted,
}

/// Starts and stops components in dependency order.
pub struct Orchestrator {
    services: Vec<Arc<dyn Service>>,
    /// Number of services currently started (a prefix of `services`).
    started: Mutex<usize>,
    ready: watch::Sender<bool>,
}

impl Orchestrator {
    /// Create an orchestrator for `services`, listed dependencies first.
    pub fn new(services: Vec<Arc<dyn Service>>) -> Self {
        let (ready, _) = watch::channel(false);
        Self::with_readiness(services, ready)
    }

    /// Like [`new`](Self::new), publishing readiness on `ready`.
    pub fn with_readiness(services: Vec<Arc<dyn Service>>, ready: watch::Sender<bool>) -> Self {
        ready.send_replace(false);
        Self {
            services,
            started: Mutex::new(0),
            ready,
        }
    }

    /// Subscribe to readiness changes.
    pub fn readiness(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Component names in start order.
    pub fn names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name().to_string()).collect()
    }

    /// Start every component in order; ready only once all have started.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let mut started = self.started.lock().await;
        if *started > 0 {
            return Err(LifecycleError::AlreadyStarted);
        }

        for service in &self.services {
            info!(component = service.name(), "Starting component");
            if let Err(e) = service.start().await {
                error!(
                    component = service.name(),
                    error = %format!("{e:#}"),
                    "Component failed to start; rolling back"
                );
                Self::stop_prefix(&self.services[..*started]).await;
                *started = 0;
                return Err(LifecycleError::StartupFailure {
                    component: service.name().to_string(),
                    source: e,
                });
            }
            *started += 1;
        }

        self.ready.send_replace(true);
        info!(components = *started, "All components started; ready");
        Ok(())
    }

    /// Stop every started component, newest first.
    ///
    /// Readiness drops before the first component is stopped. Stop errors are
    /// logged and do not prevent the remaining components from stopping.
    pub async fn stop(&self) {
        self.ready.send_replace(false);
        let mut started = self.started.lock().await;
        Self::stop_prefix(&self.services[..*started]).await;
        *started = 0;
    }

    async fn stop_prefix(services: &[Arc<dyn Service>]) {
        for service in services.iter().rev() {
            info!(component = service.name(), "Stopping component");
            if let Err(e) = service.stop().await {
                warn!(
                    component = service.name(),
                    error = %format!("{e:#}"),
                    "Component did not stop cleanly"
                );
            }
        }
    }
}
