//! # switchyard-registry
//!
//! Discovery registry model and watch clients for the switchyard gateway.
//!
//! ## Model
//!
//! - A registry tracks which running instances implement a named service
//! - Every change to a service's membership bumps a registry-wide index
//! - Clients watch with the last index they saw and get the full membership
//!   back once the index moves past it (or the wait elapses)
//!
//! ## Clients
//!
//! - [`HttpRegistry`]: long-poll client for an HTTP registry
//! - [`MemoryRegistry`]: in-process registry for static membership and tests

mod error;
mod http;
mod memory;
mod types;

use std::time::Duration;

use async_trait::async_trait;

pub use error::RegistryError;
pub use http::HttpRegistry;
pub use memory::MemoryRegistry;
pub use types::*;

/// A watch-capable membership registry.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Wait for the membership of `service` to move past `after_index`.
    ///
    /// Returns as soon as the registry index for the service is greater than
    /// `after_index`, or with the unchanged membership once `wait` elapses.
    /// `None` asks for the current membership without waiting.
    async fn watch(
        &self,
        service: &ServiceName,
        after_index: Option<u64>,
        wait: Duration,
    ) -> Result<Membership, RegistryError>;
}
