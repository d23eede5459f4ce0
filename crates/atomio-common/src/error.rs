//! Error types for Atomio
//!
//! Two layers: [`StoreError`] is what a backend store primitive or
//! connection factory reports for a single request; [`Error`] is what the
//! write-back queue and storage facade return to their callers.

use crate::types::Sequence;
use thiserror::Error;

/// Common result type for Atomio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Per-request backend failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("store primitive panicked: {0}")]
    Panicked(String),
}

impl StoreError {
    /// Create a backend error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Check if a retry of the same request could succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::ConnectionFailed(_))
    }
}

/// Common error type for Atomio
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection pool exhausted: requested capacity {requested}")]
    PoolExhausted { requested: usize },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A store failure that happened asynchronously and is being reported
    /// at the next fence.
    #[error("deferred store failure for {key} (entry {sequence}): {source}")]
    BarrierPropagated {
        key: String,
        sequence: Sequence,
        #[source]
        source: StoreError,
    },

    #[error("write-back queue full: depth {depth} at high watermark {high}")]
    QueueFull { depth: usize, high: usize },

    #[error("storage session is closed")]
    Closed,

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a not implemented error
    pub fn not_implemented(feature: impl Into<String>) -> Self {
        Self::NotImplemented(feature.into())
    }

    /// The backend failure carried by this error, deferred or direct
    #[must_use]
    pub const fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::Store(e) | Self::BarrierPropagated { source: e, .. } => Some(e),
            _ => None,
        }
    }

    /// Check if this error was reported at a fence rather than at the call
    /// that caused it
    #[must_use]
    pub const fn is_deferred(&self) -> bool {
        matches!(self, Self::BarrierPropagated { .. })
    }

    /// Check if this error is fatal for the storage session
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::PoolExhausted { .. } | Self::Closed | Self::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_retryable() {
        assert!(StoreError::Timeout.is_retryable());
        assert!(StoreError::ConnectionFailed("refused".into()).is_retryable());
        assert!(!StoreError::backend("bad dag").is_retryable());
        assert!(!StoreError::Panicked("boom".into()).is_retryable());
    }

    #[test]
    fn test_deferred_error_carries_source() {
        let err = Error::BarrierPropagated {
            key: "atom-7".into(),
            sequence: Sequence::new(7),
            source: StoreError::Timeout,
        };
        assert!(err.is_deferred());
        assert_eq!(err.store_error(), Some(&StoreError::Timeout));
        assert!(err.to_string().contains("atom-7"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_direct_store_error() {
        let err: Error = StoreError::backend("refused").into();
        assert!(!err.is_deferred());
        assert_eq!(err.to_string(), "backend error: refused");
    }

    #[test]
    fn test_fatal_errors() {
        assert!(Error::config("zero workers").is_fatal());
        assert!(Error::PoolExhausted { requested: 0 }.is_fatal());
        assert!(Error::Closed.is_fatal());
        assert!(!Error::QueueFull { depth: 3, high: 2 }.is_fatal());
    }
}
