use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;
use tusk_core::{CompletedPart, INFO_SUFFIX};
use tusk_storage::{MemoryBackend, MultipartStore, StorageError, StorageResult};

/// Memory backend wrapper that fails selected operations on demand.
#[allow(dead_code)]
pub struct FlakyBackend {
    pub inner: Arc<MemoryBackend>,
    /// Number of upcoming sidecar writes to reject.
    pub fail_record_puts: AtomicUsize,
    /// Reject every sidecar delete while set.
    pub fail_record_deletes: AtomicBool,
    /// Reject every session abort while set.
    pub fail_aborts: AtomicBool,
    /// Park every part upload until `release_parts` is notified.
    pub hold_parts: AtomicBool,
    /// Notified when a held part upload is parked.
    pub part_entered: Notify,
    pub release_parts: Notify,
}

#[allow(dead_code)]
impl FlakyBackend {
    pub fn new(min_part_size: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(MemoryBackend::new(min_part_size)),
            fail_record_puts: AtomicUsize::new(0),
            fail_record_deletes: AtomicBool::new(false),
            fail_aborts: AtomicBool::new(false),
            hold_parts: AtomicBool::new(false),
            part_entered: Notify::new(),
            release_parts: Notify::new(),
        })
    }

    fn injected(what: &str) -> StorageError {
        StorageError::Io(std::io::Error::other(format!("injected {what} failure")))
    }
}

#[async_trait]
impl MultipartStore for FlakyBackend {
    async fn open_session(&self, key: &str) -> StorageResult<String> {
        self.inner.open_session(key).await
    }

    async fn upload_part(
        &self,
        session_id: &str,
        key: &str,
        part_number: u32,
        data: Bytes,
    ) -> StorageResult<String> {
        if self.hold_parts.load(Ordering::SeqCst) {
            self.part_entered.notify_one();
            self.release_parts.notified().await;
        }
        self.inner
            .upload_part(session_id, key, part_number, data)
            .await
    }

    async fn complete_session(
        &self,
        session_id: &str,
        key: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        self.inner.complete_session(session_id, key, parts).await
    }

    async fn abort_session(&self, session_id: &str, key: &str) -> StorageResult<()> {
        if self.fail_aborts.load(Ordering::SeqCst) {
            return Err(Self::injected("abort"));
        }
        self.inner.abort_session(session_id, key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        if key.ends_with(INFO_SUFFIX)
            && self
                .fail_record_puts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(Self::injected("put"));
        }
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        if key.ends_with(INFO_SUFFIX) && self.fail_record_deletes.load(Ordering::SeqCst) {
            return Err(Self::injected("delete"));
        }
        self.inner.delete(key).await
    }

    fn min_part_size(&self) -> u64 {
        self.inner.min_part_size()
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}
