//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use tusk_core::CompletedPart;

/// Backend object channel: an S3-style multipart store.
///
/// A multipart session is opened for an object key, receives numbered parts in
/// any order, and is finalized once with the ordered list of part tags. Until
/// completion the object is not visible. Small whole objects (the metadata
/// sidecars) go through `put`/`get`/`delete`.
#[async_trait]
pub trait MultipartStore: Send + Sync + 'static {
    /// Open a multipart session for `key` and return its session id.
    async fn open_session(&self, key: &str) -> StorageResult<String>;

    /// Upload one part and return the backend-assigned tag.
    ///
    /// Part numbers are 1-based. Uploading the same number twice replaces the
    /// earlier part.
    async fn upload_part(
        &self,
        session_id: &str,
        key: &str,
        part_number: u32,
        data: Bytes,
    ) -> StorageResult<String>;

    /// Finalize a session from its ordered part list.
    ///
    /// Fails for gaps, wrong order, unknown tags, undersized non-final parts
    /// and unknown or already completed sessions. An empty list produces an
    /// empty object.
    async fn complete_session(
        &self,
        session_id: &str,
        key: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()>;

    /// Abort a session and discard its uploaded parts.
    async fn abort_session(&self, session_id: &str, key: &str) -> StorageResult<()>;

    /// Put a whole object, replacing any existing one.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Get a whole object.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Delete an object. Returns `NotFound` if it does not exist.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Smallest size accepted for any part except the last.
    fn min_part_size(&self) -> u64;

    /// Get the name of this storage backend.
    ///
    /// Returns a static string identifier for the backend type (e.g., "s3", "memory").
    /// Used for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// The default implementation returns Ok(()), suitable for backends that
    /// don't require connectivity verification.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}
