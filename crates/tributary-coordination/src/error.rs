//! Coordination error types.

use thiserror::Error;

/// Result alias for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Errors that can occur while talking to the partition coordinator.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The caller tried to update a partition whose lease it no longer
    /// holds. This is how a worker learns that its lease went stale and
    /// was reclaimed by someone else.
    #[error("partition {0} is not owned by this worker")]
    NotOwned(String),

    /// The partition does not exist in the coordination store.
    #[error("partition {0} was not found")]
    NotFound(String),

    /// The backing store failed.
    #[error("coordination store error: {0}")]
    Store(String),
}
