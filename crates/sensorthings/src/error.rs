//! Error types for the SensorThings and Processes clients.

use std::sync::Arc;
use thiserror::Error;

/// Errors produced while talking to the sensor registry or process catalog.
#[derive(Error, Debug)]
pub enum StaError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} {url} returned HTTP {status}: {body}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },

    #[error("invalid response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },

    #[error("invalid URL '{0}'")]
    InvalidUrl(String),

    #[error("entity rejected: {0}")]
    Rejected(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cancelled before the request was sent")]
    Cancelled,

    /// A resolution that already failed for good earlier in the run
    #[error("{0}")]
    Permanent(Arc<StaError>),
}

impl StaError {
    /// Connection failures, timeouts, 5xx and 429 are worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            StaError::Http(e) => e.is_timeout() || e.is_connect(),
            StaError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Rejections that every similar request would meet as well: client
    /// errors other than timeout and rate limiting, and payloads refused
    /// before sending.
    pub fn is_configuration(&self) -> bool {
        match self {
            StaError::Status { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            StaError::Rejected(_) | StaError::InvalidUrl(_) => true,
            StaError::Permanent(inner) => inner.is_configuration(),
            _ => false,
        }
    }
}

/// Result alias for registry operations.
pub type Result<T> = std::result::Result<T, StaError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> StaError {
        StaError::Status {
            method: "POST",
            url: "http://sta/Things".into(),
            status: code,
            body: String::new(),
        }
    }

    #[test]
    fn retryable_statuses() {
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!StaError::Rejected("bad".into()).is_retryable());
        assert!(!StaError::Cancelled.is_retryable());
    }

    #[test]
    fn configuration_errors() {
        assert!(status(400).is_configuration());
        assert!(status(422).is_configuration());
        assert!(!status(429).is_configuration());
        assert!(!status(408).is_configuration());
        assert!(!status(502).is_configuration());
        assert!(StaError::Permanent(Arc::new(status(404))).is_configuration());
        assert!(!StaError::Cancelled.is_configuration());
    }
}
