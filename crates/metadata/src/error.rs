//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("upload record not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] tusk_storage::StorageError),

    #[error("malformed upload record: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MetadataError {
    /// Whether the record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, MetadataError::NotFound(_))
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
