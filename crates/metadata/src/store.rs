//! Metadata store trait and the sidecar implementation.

use crate::error::{MetadataError, MetadataResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::instrument;
use tusk_core::{UploadInfo, info_key};
use tusk_storage::{MultipartStore, StorageError};

/// Durable store for in-progress upload records.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    /// Get the record for an upload. Returns `NotFound` if it does not exist.
    async fn get(&self, id: &str) -> MetadataResult<UploadInfo>;

    /// Write the record for an upload, replacing any previous version.
    async fn put(&self, id: &str, info: &UploadInfo) -> MetadataResult<()>;

    /// Delete the record for an upload. Returns `NotFound` if it does not exist.
    async fn delete(&self, id: &str) -> MetadataResult<()>;

    /// Check that the underlying storage is reachable.
    async fn health_check(&self) -> MetadataResult<()> {
        Ok(())
    }
}

/// Keeps each record as a JSON object under `<id>.info` next to the upload.
#[derive(Clone)]
pub struct SidecarStore {
    storage: Arc<dyn MultipartStore>,
}

impl SidecarStore {
    pub fn new(storage: Arc<dyn MultipartStore>) -> Self {
        Self { storage }
    }

    fn map_storage(id: &str, err: StorageError) -> MetadataError {
        match err {
            StorageError::NotFound(_) => MetadataError::NotFound(id.to_string()),
            other => MetadataError::Storage(other),
        }
    }
}

impl std::fmt::Debug for SidecarStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SidecarStore")
            .field("backend", &self.storage.backend_name())
            .finish()
    }
}

#[async_trait]
impl MetadataStore for SidecarStore {
    #[instrument(skip(self), fields(backend = self.storage.backend_name()))]
    async fn get(&self, id: &str) -> MetadataResult<UploadInfo> {
        let raw = self
            .storage
            .get(&info_key(id))
            .await
            .map_err(|e| Self::map_storage(id, e))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    #[instrument(skip(self, info), fields(backend = self.storage.backend_name(), offset = info.offset))]
    async fn put(&self, id: &str, info: &UploadInfo) -> MetadataResult<()> {
        let body = serde_json::to_vec(info)?;
        self.storage.put(&info_key(id), Bytes::from(body)).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = self.storage.backend_name()))]
    async fn delete(&self, id: &str) -> MetadataResult<()> {
        self.storage
            .delete(&info_key(id))
            .await
            .map_err(|e| Self::map_storage(id, e))
    }

    async fn health_check(&self) -> MetadataResult<()> {
        self.storage.health_check().await?;
        Ok(())
    }
}
