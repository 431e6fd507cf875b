//! Request-level error taxonomy and client-visible problem responses.
//!
//! Every failure a caller can observe maps to a stable status code and a
//! machine-readable `code`, returned as an `application/problem+json` body and
//! mirrored in the `x-switchyard-error` header.

use std::time::Duration;

use http::header::{CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderValue, Response, StatusCode};
use serde::Serialize;
use switchyard_registry::ServiceName;
use thiserror::Error;

use crate::proxy::body::{self, GatewayBody};

/// Header carrying the error code on gateway-generated responses.
pub const ERROR_HEADER: &str = "x-switchyard-error";

/// Retry hint returned with `429 pool_exhausted`.
pub const POOL_EXHAUSTED_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Failures of a single proxied request.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("security backend unavailable: {0}")]
    SecurityBackendUnavailable(String),

    #[error("no route matched {0}")]
    NoRouteMatched(String),

    #[error("connection pool for {endpoint} exhausted")]
    PoolExhausted { endpoint: String },

    #[error("backend {endpoint} unreachable: {reason}")]
    BackendConnectionFailure { endpoint: String, reason: String },

    #[error("backend {endpoint} protocol error: {reason}")]
    BackendProtocolFailure { endpoint: String, reason: String },

    #[error("no available endpoint for service {0}")]
    ServiceUnavailable(ServiceName),

    #[error("request cancelled")]
    Cancelled,
}

impl GatewayError {
    pub fn connection_failure(endpoint: impl ToString, reason: impl ToString) -> Self {
        Self::BackendConnectionFailure {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn protocol_failure(endpoint: impl ToString, reason: impl ToString) -> Self {
        Self::BackendProtocolFailure {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Status returned to the caller.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::AuthenticationFailure(_) => StatusCode::UNAUTHORIZED,
            Self::NoRouteMatched(_) => StatusCode::NOT_FOUND,
            Self::PoolExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::BackendConnectionFailure { .. } | Self::BackendProtocolFailure { .. } => {
                StatusCode::BAD_GATEWAY
            }
            Self::SecurityBackendUnavailable(_) | Self::ServiceUnavailable(_) | Self::Cancelled => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthenticationFailure(_) => "authentication_failed",
            Self::SecurityBackendUnavailable(_) => "security_unavailable",
            Self::NoRouteMatched(_) => "no_route",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::BackendConnectionFailure { .. } => "backend_unreachable",
            Self::BackendProtocolFailure { .. } => "backend_protocol_error",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the forwarder may retry on another endpoint.
    ///
    /// Only holds when the request was handed back unsent; see the forwarder.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendConnectionFailure { .. })
    }

    /// Detail shown to the caller. Authentication failures never echo the
    /// verifier's reason.
    fn client_detail(&self) -> String {
        match self {
            Self::AuthenticationFailure(_) => "credentials missing or rejected".to_string(),
            Self::SecurityBackendUnavailable(_) => {
                "credentials could not be verified; try again later".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Build the problem response for this error.
    ///
    /// `Cancelled` produces an empty 503; the caller is normally gone and never
    /// sees it.
    pub fn to_response(&self, request_id: &str) -> Response<GatewayBody> {
        let status = self.status();
        let code = self.code();

        let body = if matches!(self, Self::Cancelled) {
            body::empty()
        } else {
            let mut problem = ProblemDetails::new(status, code, self.client_detail(), request_id);
            if matches!(self, Self::PoolExhausted { .. }) {
                problem.set_retry_after_seconds(POOL_EXHAUSTED_RETRY_AFTER.as_secs() as u32);
            }
            body::full(serde_json::to_vec(&problem).unwrap_or_default())
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(ERROR_HEADER, HeaderValue::from_static(code));
        if !matches!(self, Self::Cancelled) {
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/problem+json"),
            );
        }
        if matches!(self, Self::PoolExhausted { .. }) {
            headers.insert(
                RETRY_AFTER,
                HeaderValue::from(POOL_EXHAUSTED_RETRY_AFTER.as_secs()),
            );
        }
        response
    }
}

/// JSON problem body.
#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "is_zero")]
    pub retry_after_seconds: u32,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl ProblemDetails {
    fn new(
        status: StatusCode,
        code: impl Into<String>,
        detail: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            title: status
                .canonical_reason()
                .unwrap_or("Unknown Error")
                .to_string(),
            status: status.as_u16(),
            detail: detail.into(),
            code: code.into(),
            request_id: request_id.into(),
            retryable: false,
            retry_after_seconds: 0,
        }
    }

    fn set_retry_after_seconds(&mut self, seconds: u32) {
        self.retry_after_seconds = seconds;
        if seconds > 0 {
            self.retryable = true;
        }
    }
}
