//! In-process multipart backend with S3 semantics.
//!
//! Contents are lost when the process exits. The backend exists for
//! development and tests: it enforces the same part rules as S3 and counts
//! calls per operation so tests can assert exactly what reached the backend.

use crate::error::{StorageError, StorageResult};
use crate::traits::MultipartStore;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::instrument;
use tusk_core::CompletedPart;
use uuid::Uuid;

#[derive(Debug)]
struct StoredPart {
    etag: String,
    data: Bytes,
}

#[derive(Debug)]
struct Session {
    key: String,
    parts: BTreeMap<u32, StoredPart>,
}

#[derive(Debug, Default)]
struct State {
    objects: HashMap<String, Bytes>,
    sessions: HashMap<String, Session>,
}

#[derive(Debug, Default)]
struct Counters {
    open_session: AtomicUsize,
    upload_part: AtomicUsize,
    complete_session: AtomicUsize,
    abort_session: AtomicUsize,
    put: AtomicUsize,
    get: AtomicUsize,
    delete: AtomicUsize,
}

/// Snapshot of how often each operation was called.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub open_session: usize,
    pub upload_part: usize,
    pub complete_session: usize,
    pub abort_session: usize,
    pub put: usize,
    pub get: usize,
    pub delete: usize,
}

/// In-memory multipart store.
#[derive(Debug)]
pub struct MemoryBackend {
    min_part_size: u64,
    state: Mutex<State>,
    counters: Counters,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(tusk_core::DEFAULT_PART_SIZE)
    }
}

impl MemoryBackend {
    /// Create a backend enforcing `min_part_size` for non-final parts.
    pub fn new(min_part_size: u64) -> Self {
        Self {
            min_part_size,
            state: Mutex::new(State::default()),
            counters: Counters::default(),
        }
    }

    /// Calls made so far, per operation.
    pub fn call_counts(&self) -> CallCounts {
        let c = &self.counters;
        CallCounts {
            open_session: c.open_session.load(Ordering::Relaxed),
            upload_part: c.upload_part.load(Ordering::Relaxed),
            complete_session: c.complete_session.load(Ordering::Relaxed),
            abort_session: c.abort_session.load(Ordering::Relaxed),
            put: c.put.load(Ordering::Relaxed),
            get: c.get.load(Ordering::Relaxed),
            delete: c.delete.load(Ordering::Relaxed),
        }
    }

    /// A stored object, if present.
    pub async fn object(&self, key: &str) -> Option<Bytes> {
        self.state.lock().await.objects.get(key).cloned()
    }

    /// Sizes of the parts uploaded to an open session, in part-number order.
    pub async fn session_part_sizes(&self, session_id: &str) -> Option<Vec<u64>> {
        let state = self.state.lock().await;
        state.sessions.get(session_id).map(|session| {
            session
                .parts
                .values()
                .map(|part| part.data.len() as u64)
                .collect()
        })
    }

    /// Number of sessions neither completed nor aborted.
    pub async fn open_session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn assemble(&self, session: &Session, parts: &[CompletedPart]) -> StorageResult<Bytes> {
        let mut body = BytesMut::new();
        for (index, part) in parts.iter().enumerate() {
            let expected = index as u32 + 1;
            if part.part_number != expected {
                return Err(StorageError::InvalidPart(format!(
                    "expected part {expected}, got {}",
                    part.part_number
                )));
            }
            let stored = session.parts.get(&part.part_number).ok_or_else(|| {
                StorageError::InvalidPart(format!("part {} was never uploaded", part.part_number))
            })?;
            if stored.etag != part.etag {
                return Err(StorageError::InvalidPart(format!(
                    "etag mismatch for part {}",
                    part.part_number
                )));
            }
            let is_last = index + 1 == parts.len();
            if !is_last && (stored.data.len() as u64) < self.min_part_size {
                return Err(StorageError::InvalidPart(format!(
                    "part {} is {} bytes, below the minimum of {}",
                    part.part_number,
                    stored.data.len(),
                    self.min_part_size
                )));
            }
            body.extend_from_slice(&stored.data);
        }
        Ok(body.freeze())
    }
}

#[async_trait]
impl MultipartStore for MemoryBackend {
    #[instrument(skip(self), fields(backend = "memory"))]
    async fn open_session(&self, key: &str) -> StorageResult<String> {
        Self::bump(&self.counters.open_session);
        let session_id = Uuid::new_v4().simple().to_string();
        self.state.lock().await.sessions.insert(
            session_id.clone(),
            Session {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(session_id)
    }

    #[instrument(skip(self, data), fields(backend = "memory", size = data.len()))]
    async fn upload_part(
        &self,
        session_id: &str,
        key: &str,
        part_number: u32,
        data: Bytes,
    ) -> StorageResult<String> {
        Self::bump(&self.counters.upload_part);
        if part_number == 0 {
            return Err(StorageError::InvalidPart(
                "part numbers start at 1".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(session_id)
            .filter(|session| session.key == key)
            .ok_or_else(|| StorageError::NotFound(session_id.to_string()))?;

        let etag = format!("\"{}\"", Uuid::new_v4().simple());
        session.parts.insert(
            part_number,
            StoredPart {
                etag: etag.clone(),
                data,
            },
        );
        Ok(etag)
    }

    #[instrument(skip(self, parts), fields(backend = "memory", parts = parts.len()))]
    async fn complete_session(
        &self,
        session_id: &str,
        key: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        Self::bump(&self.counters.complete_session);
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get(session_id)
            .filter(|session| session.key == key)
            .ok_or_else(|| StorageError::NotFound(session_id.to_string()))?;

        // A failed completion leaves the session open, as S3 does.
        let body = self.assemble(session, parts)?;
        state.sessions.remove(session_id);
        state.objects.insert(key.to_string(), body);
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn abort_session(&self, session_id: &str, key: &str) -> StorageResult<()> {
        Self::bump(&self.counters.abort_session);
        let mut state = self.state.lock().await;
        match state.sessions.get(session_id) {
            Some(session) if session.key == key => {
                state.sessions.remove(session_id);
                Ok(())
            }
            _ => Err(StorageError::NotFound(session_id.to_string())),
        }
    }

    #[instrument(skip(self, data), fields(backend = "memory", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        Self::bump(&self.counters.put);
        self.state.lock().await.objects.insert(key.to_string(), data);
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        Self::bump(&self.counters.get);
        self.object(key)
            .await
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        Self::bump(&self.counters.delete);
        self.state
            .lock()
            .await
            .objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn min_part_size(&self) -> u64 {
        self.min_part_size
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
