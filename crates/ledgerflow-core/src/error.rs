//! Error types shared by the pool, batcher and policy primitives.

use thiserror::Error;

/// The cancellation signal fired before the operation could complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Per-item failure carried in a [`WorkResult`](crate::pool::WorkResult).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkError<E> {
    /// The work function returned an error. The caller's error is kept as-is.
    #[error(transparent)]
    Failed(E),

    /// The item was skipped because the cancellation signal fired.
    #[error("operation cancelled before the item was processed")]
    Cancelled,

    /// A batch function returned fewer values than items in its group.
    #[error("batch function returned no result for this item")]
    MissingResult,
}

impl<E> WorkError<E> {
    /// Returns `true` if the item was skipped due to cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns the caller's own error, if this is one.
    pub fn as_failed(&self) -> Option<&E> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<Cancelled> for WorkError<E> {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// Errors returned by [`CircuitBreaker::execute`](crate::policy::CircuitBreaker::execute).
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Circuit is open; the operation was rejected without being invoked.
    #[error("circuit breaker is open")]
    Open,

    /// The cancellation signal fired before the operation was invoked.
    #[error("operation cancelled")]
    Cancelled,

    /// The guarded operation itself failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Returns `true` for the open-circuit rejection.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Unwrap the guarded operation's error, if any.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}
