//! Error types for registry access.

use thiserror::Error;

/// Errors that can occur when talking to a discovery registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The registry could not be reached.
    #[error("registry unreachable: {0}")]
    Unreachable(String),

    /// The registry answered with an unexpected status.
    #[error("registry returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The registry response could not be decoded.
    #[error("invalid registry response: {0}")]
    InvalidResponse(String),

    /// The service name is not acceptable.
    #[error("invalid service name: {0}")]
    InvalidServiceName(String),
}

impl RegistryError {
    /// Returns true if this error means the registry itself is unavailable,
    /// as opposed to a malformed exchange.
    pub fn is_unreachable(&self) -> bool {
        match self {
            RegistryError::Unreachable(_) => true,
            RegistryError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RegistryError::InvalidResponse(err.to_string())
        } else {
            RegistryError::Unreachable(err.to_string())
        }
    }
}
