//! Backend object channel for tusk.
//!
//! This crate provides:
//! - The `MultipartStore` contract: multipart sessions plus small whole objects
//! - Backends: S3-compatible and in-process memory

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::{
    memory::{CallCounts, MemoryBackend},
    s3::S3Backend,
};
pub use error::{StorageError, StorageResult};
pub use traits::MultipartStore;

use std::sync::Arc;
use tusk_core::config::StorageConfig;

/// Create a multipart store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn MultipartStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Memory { min_part_size } => {
            Ok(Arc::new(MemoryBackend::new(*min_part_size)))
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => {
            let backend = S3Backend::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                prefix.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
            )
            .await?;
            Ok(Arc::new(backend))
        }
    }
}
