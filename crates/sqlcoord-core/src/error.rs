//! Error types for pool, lock and queue operations.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while coordinating through the store.
#[derive(Error, Debug)]
pub enum CoordError {
    /// Lock acquisition did not succeed within the caller's timeout.
    #[error("timed out after {timeout:?} waiting for lock on '{resource}'")]
    LockTimeout {
        /// Resource that could not be locked.
        resource: String,
        /// Timeout the caller asked for.
        timeout: Duration,
    },

    /// The lock row was gone when its holder tried to release it.
    ///
    /// Either the lock expired and was swept, or a third party deleted it.
    /// This is never treated as "already released".
    #[error("lock on '{resource}' held by '{acquirer}' no longer exists")]
    LockViolation {
        /// Resource named by the handle.
        resource: String,
        /// Acquirer identity recorded in the handle.
        acquirer: String,
    },

    /// The operation was cancelled by the caller.
    #[error("operation was cancelled")]
    Cancelled,

    /// The store rejected a statement because of a concurrent update.
    #[error("serialization conflict: {0}")]
    SerializationConflict(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A connection could not be opened, or broke mid-statement.
    #[error("connection error: {0}")]
    Connection(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Backend-specific error.
    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The pool has been closed.
    #[error("connection pool is closed")]
    PoolClosed,

    /// A pooled connection was used after it had been released.
    #[error("connection lease was already released")]
    LeaseReleased,

    /// Invalid resource or queue name.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CoordError {
    /// Wraps any error as a connection failure.
    pub fn connection(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Connection(err.into())
    }

    /// Wraps any error as a backend failure.
    pub fn backend(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Backend(err.into())
    }

    /// Returns true for conditions a caller may simply retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SerializationConflict(_))
    }
}

/// Result type for coordination operations.
pub type CoordResult<T> = Result<T, CoordError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_conflicts_are_transient() {
        let conflict = CoordError::SerializationConflict("could not serialize access".into());
        assert!(conflict.is_transient());
        assert!(!CoordError::Cancelled.is_transient());
        assert!(!CoordError::connection("refused").is_transient());
    }

    #[test]
    fn test_timeout_and_cancel_are_distinct() {
        let timeout = CoordError::LockTimeout {
            resource: "report".to_string(),
            timeout: Duration::from_millis(100),
        };
        assert!(timeout.to_string().contains("report"));
        assert_ne!(timeout.to_string(), CoordError::Cancelled.to_string());
    }
}
