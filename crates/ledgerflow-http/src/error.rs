//! Batch executor error types.

use serde::Deserialize;
use thiserror::Error;

/// Coarse classification callers use to decide whether to try again later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport failure or timeout; worth retrying later.
    Network,
    /// The service answered with an error status or an unusable body.
    Internal,
    /// The circuit breaker rejected the call without contacting the service.
    CircuitOpen,
    /// The cancellation signal fired.
    Cancelled,
    /// The caller supplied something unusable.
    Validation,
    /// A sub-response was looked up by an id the batch does not contain.
    NotFound,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Internal => write!(f, "internal"),
            Self::CircuitOpen => write!(f, "circuit-open"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Validation => write!(f, "validation"),
            Self::NotFound => write!(f, "not-found"),
        }
    }
}

/// Errors produced while executing or demultiplexing a batch.
#[derive(Debug, Error)]
pub enum BatchError {
    /// Connection refused, reset, DNS failure, broken body stream.
    #[error("network error: {0}")]
    Network(String),

    /// The batch did not complete before its deadline.
    #[error("batch request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The batch endpoint answered with a non-2xx status.
    #[error("batch request failed with status {status}{}", suffix(.message))]
    Status { status: u16, message: Option<String> },

    /// One or more sub-requests inside a successful batch failed.
    #[error("{failed} of {total} batch requests failed; first: {first}")]
    SubRequests {
        failed: usize,
        total: usize,
        first: String,
    },

    /// A single sub-response reported a failure.
    #[error("request {id} failed with status {status}: {message}")]
    Request {
        id: String,
        status: u16,
        message: String,
    },

    #[error("no response found for request ID: {0}")]
    NotFound(String),

    /// Circuit breaker is open; the service is considered unhealthy.
    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("operation cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid batch: {0}")]
    Invalid(String),
}

fn suffix(message: &Option<String>) -> String {
    message.as_deref().map(|m| format!(": {m}")).unwrap_or_default()
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: String,
}

impl BatchError {
    /// Build a status error, taking the message from an `{"error": "..."}`
    /// body when there is one.
    pub fn from_status(status: u16, body: &[u8]) -> Self {
        let message = serde_json::from_slice::<ErrorEnvelope>(body)
            .ok()
            .map(|e| e.error)
            .filter(|m| !m.is_empty());
        Self::Status { status, message }
    }

    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_builder() {
            Self::Invalid(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }

    /// Returns `true` if repeating the same batch may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) | Self::Timeout { .. } => ErrorKind::Network,
            Self::Status { .. }
            | Self::SubRequests { .. }
            | Self::Request { .. }
            | Self::Serialization(_) => ErrorKind::Internal,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::CircuitOpen => ErrorKind::CircuitOpen,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Invalid(_) => ErrorKind::Validation,
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } | Self::Request { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_with_envelope() {
        let err = BatchError::from_status(422, br#"{"error":"amount must be positive"}"#);
        assert_eq!(
            err.to_string(),
            "batch request failed with status 422: amount must be positive"
        );
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.status(), Some(422));
        assert!(!err.is_retryable());
    }

    #[test]
    fn status_without_envelope() {
        let err = BatchError::from_status(503, b"<html>gateway</html>");
        assert_eq!(err.to_string(), "batch request failed with status 503");
        assert!(err.is_retryable());
    }

    #[test]
    fn circuit_open_is_distinct() {
        let open = BatchError::CircuitOpen;
        let net = BatchError::Network("connection refused".into());
        assert_eq!(open.kind(), ErrorKind::CircuitOpen);
        assert_eq!(net.kind(), ErrorKind::Network);
        assert!(!open.is_retryable());
        assert!(net.is_retryable());
    }
}
