//! Agent Core error types.

use thiserror::Error;

use crate::inference::UpstreamError;

/// Errors that can occur during agent core operations.
#[derive(Debug, Error)]
pub enum DeskError {
    /// Malformed inbound request. Rejected before any session mutation.
    #[error("invalid request: {reason}")]
    Validation { reason: String },

    /// Upstream failure that is worth retrying (timeout, rate limit, 5xx).
    #[error("upstream {service} unavailable: {reason}")]
    TransientUpstream { service: String, reason: String },

    /// Permanent upstream failure (auth, malformed response).
    #[error("upstream {service} failed: {reason}")]
    TerminalUpstream { service: String, reason: String },

    /// Another turn for this session is in flight and the queue is full.
    #[error("session '{session_id}' is busy")]
    SessionBusy { session_id: String },

    /// Session not found.
    #[error("session not found: '{session_id}'")]
    SessionNotFound { session_id: String },

    /// Session was explicitly closed.
    #[error("session '{session_id}' is closed")]
    SessionClosed { session_id: String },

    /// Backing store failure.
    #[error("storage error: {reason}")]
    Storage { reason: String },

    /// Serialization error.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// Turn deadline exceeded or caller went away.
    #[error("turn cancelled: {reason}")]
    Cancelled { reason: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    Config { reason: String },
}

impl DeskError {
    /// Whether the caller may resubmit the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeskError::SessionBusy { .. } | DeskError::TransientUpstream { .. }
        )
    }

    /// Classify an adapter error for the given service.
    pub fn upstream(service: &str, e: UpstreamError) -> Self {
        if let UpstreamError::ConfigError { reason } = e {
            return DeskError::Config { reason };
        }
        if e.is_transient() {
            DeskError::TransientUpstream {
                service: service.to_string(),
                reason: e.to_string(),
            }
        } else {
            DeskError::TerminalUpstream {
                service: service.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

impl From<rusqlite::Error> for DeskError {
    fn from(e: rusqlite::Error) -> Self {
        DeskError::Storage {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for DeskError {
    fn from(e: serde_json::Error) -> Self {
        DeskError::Serialization {
            reason: e.to_string(),
        }
    }
}

impl From<UpstreamError> for DeskError {
    fn from(e: UpstreamError) -> Self {
        DeskError::upstream("upstream", e)
    }
}
