//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid stream id: {0}")]
    InvalidStreamId(String),

    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("invalid placement constraint: {0}")]
    InvalidPlacement(i64),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
