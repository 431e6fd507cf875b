//! Registry wire types.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::RegistryError;

/// Maximum accepted length of a service name.
const MAX_SERVICE_NAME_LEN: usize = 253;

/// Name of a logical backend service.
///
/// Immutable and cheap to clone; used as the discovery key and as the target
/// of a route.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceName(Arc<str>);

impl ServiceName {
    /// Validate and wrap a service name.
    ///
    /// Names are non-empty, at most 253 bytes, and contain only ASCII
    /// alphanumerics, `-`, `_` and `.`.
    pub fn new(name: impl AsRef<str>) -> Result<Self, RegistryError> {
        let name = name.as_ref().trim();
        if name.is_empty() {
            return Err(RegistryError::InvalidServiceName(
                "service name cannot be empty".to_string(),
            ));
        }
        if name.len() > MAX_SERVICE_NAME_LEN {
            return Err(RegistryError::InvalidServiceName(format!(
                "service name longer than {MAX_SERVICE_NAME_LEN} bytes"
            )));
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(RegistryError::InvalidServiceName(format!(
                "'{name}' contains invalid character '{c}'"
            )));
        }
        Ok(Self(Arc::from(name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServiceName {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ServiceName {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ServiceName> for String {
    fn from(value: ServiceName) -> Self {
        value.0.to_string()
    }
}

/// One registered instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instance {
    /// Registry-assigned instance identifier.
    pub id: String,
    /// Host name or IP address.
    pub host: String,
    /// Port the instance serves on.
    pub port: u16,
    /// Whether the instance expects TLS.
    #[serde(default)]
    pub secure: bool,
}

impl Instance {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            secure: false,
        }
    }

    /// Mark the instance as TLS-only.
    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }
}

/// Membership of one service at a registry index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    /// Registry index of the last change to this service.
    pub index: u64,
    /// Registered instances, in registry order.
    #[serde(default)]
    pub instances: Vec<Instance>,
}

impl Membership {
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
