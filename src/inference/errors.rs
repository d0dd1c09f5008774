//! Upstream service error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility; these types carry the context needed to build
//! meaningful log entries.

use thiserror::Error;

/// Errors returned by the classification, search, and automation adapters.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// TCP/HTTP connection to the service endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The service did not respond within the configured timeout.
    #[error("{service} timeout after {duration_ms}ms")]
    Timeout { service: String, duration_ms: u64 },

    /// HTTP 429 from the service.
    #[error("rate limited by {endpoint}")]
    RateLimited { endpoint: String },

    /// HTTP 401/403 from the service.
    #[error("unauthorized by {endpoint} (HTTP {status})")]
    Unauthorized { endpoint: String, status: u16 },

    /// Any other non-2xx HTTP response.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The service answered 2xx but the body did not have the expected shape.
    #[error("malformed response: {reason}")]
    MalformedResponse { reason: String },

    /// The request was rejected before it was sent.
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl UpstreamError {
    /// Whether retrying the same request may succeed.
    ///
    /// Timeouts, connection failures, rate limits and 5xx responses are
    /// transient. Auth failures, 4xx and malformed bodies are terminal.
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Timeout { .. }
            | UpstreamError::ConnectionFailed { .. }
            | UpstreamError::RateLimited { .. } => true,
            UpstreamError::HttpError { status, .. } => matches!(status, 500..=599),
            _ => false,
        }
    }

    /// Map a non-success HTTP status to the matching variant.
    pub fn from_status(endpoint: &str, status: u16, body: String) -> Self {
        match status {
            401 | 403 => UpstreamError::Unauthorized {
                endpoint: endpoint.to_string(),
                status,
            },
            429 => UpstreamError::RateLimited {
                endpoint: endpoint.to_string(),
            },
            _ => UpstreamError::HttpError { status, body },
        }
    }

    /// Map a `reqwest` transport error.
    pub fn from_reqwest(service: &str, endpoint: &str, timeout_ms: u64, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout {
                service: service.to_string(),
                duration_ms: timeout_ms,
            }
        } else if e.is_decode() {
            UpstreamError::MalformedResponse {
                reason: e.to_string(),
            }
        } else {
            UpstreamError::ConnectionFailed {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            }
        }
    }
}
