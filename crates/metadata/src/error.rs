//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// No row was eligible for a claim. Workers should back off, not alarm.
    #[error("{queue} queue is empty")]
    EmptyQueue { queue: &'static str },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unsupported backend: {0}")]
    UnsupportedBackend(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    /// Whether this is the empty-queue signal rather than a failure.
    pub fn is_empty_queue(&self) -> bool {
        matches!(self, Self::EmptyQueue { .. })
    }

    /// Whether the store reported a serialization or contention conflict
    /// that the caller may retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            // 40001: serialization_failure, 40P01: deadlock_detected
            Self::Database(sqlx::Error::Database(db_err)) => matches!(
                db_err.code().as_deref(),
                Some("40001") | Some("40P01")
            ),
            Self::Database(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }
}

/// Map a unique-constraint violation to `AlreadyExists`, leaving every other
/// database error as is.
pub(crate) fn map_unique_violation(err: sqlx::Error, what: impl FnOnce() -> String) -> MetadataError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            MetadataError::AlreadyExists(what())
        }
        _ => MetadataError::Database(err),
    }
}

impl From<mender_core::Error> for MetadataError {
    fn from(e: mender_core::Error) -> Self {
        MetadataError::Decode(e.to_string())
    }
}

impl From<std::io::Error> for MetadataError {
    fn from(e: std::io::Error) -> Self {
        MetadataError::Config(e.to_string())
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_queue_is_distinguishable() {
        let err = MetadataError::EmptyQueue {
            queue: "repair",
        };
        assert!(err.is_empty_queue());
        assert_eq!(err.to_string(), "repair queue is empty");

        let err = MetadataError::NotFound("job".to_string());
        assert!(!err.is_empty_queue());
    }

    #[test]
    fn test_core_errors_become_decode_errors() {
        let core_err = mender_core::StreamId::from_bytes(&[0u8; 4]).unwrap_err();
        let err: MetadataError = core_err.into();
        assert!(matches!(err, MetadataError::Decode(_)));
        assert!(!err.is_retryable());
    }
}
