//! Session metadata store for tusk.
//!
//! Each in-progress upload has exactly one durable record. The record lives
//! in the storage backend as a JSON sidecar keyed `<id>.info`, separate from
//! the object key `<id>`, and is deleted once the upload completes or is
//! aborted.

pub mod error;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use store::{MetadataStore, SidecarStore};

use std::sync::Arc;
use tusk_storage::MultipartStore;

/// Create the metadata store that shares a storage backend with the uploads.
pub fn from_storage(storage: Arc<dyn MultipartStore>) -> Arc<dyn MetadataStore> {
    Arc::new(SidecarStore::new(storage))
}
