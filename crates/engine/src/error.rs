//! Engine error types.

use thiserror::Error;
use tusk_metadata::MetadataError;
use tusk_storage::StorageError;

/// Error produced by a request body stream.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Upload engine errors.
///
/// Front ends map these onto protocol statuses through [`EngineError::code`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid upload length: {0}")]
    InvalidLength(String),

    #[error("naming error: {0}")]
    Naming(#[from] tusk_core::NamingError),

    #[error("upload not found: {0}")]
    FileNotFound(String),

    #[error("upload {0} is locked by another request")]
    Locked(String),

    #[error("offset mismatch: upload is at {expected}, request starts at {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },

    #[error("write of {fragment} bytes at offset {offset} exceeds upload length {length}")]
    ExceedsLength {
        offset: u64,
        fragment: u64,
        length: u64,
    },

    #[error("upload length {length} exceeds maximum of {max} bytes")]
    EntityTooLarge { length: u64, max: u64 },

    #[error("request body error: {0}")]
    Stream(#[source] BoxError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),
}

impl EngineError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidLength(_) => "invalid_length",
            Self::Naming(_) => "naming_error",
            Self::FileNotFound(_) => "file_not_found",
            Self::Locked(_) => "locked",
            Self::OffsetMismatch { .. } => "offset_mismatch",
            Self::ExceedsLength { .. } => "exceeds_length",
            Self::EntityTooLarge { .. } => "entity_too_large",
            Self::Stream(_) => "stream_error",
            Self::Config(_) => "config_error",
            Self::Storage(_) => "storage_error",
            Self::Metadata(_) => "metadata_error",
        }
    }

    /// Translate a metadata error about the record of `id`.
    pub(crate) fn from_record(id: &str, err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound(_) => Self::FileNotFound(id.to_string()),
            other => Self::Metadata(other),
        }
    }
}

impl From<tusk_core::Error> for EngineError {
    fn from(err: tusk_core::Error) -> Self {
        match err {
            tusk_core::Error::InvalidLength(msg) => Self::InvalidLength(msg),
            tusk_core::Error::Naming(e) => Self::Naming(e),
            tusk_core::Error::Config(msg) => Self::Config(msg),
        }
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
