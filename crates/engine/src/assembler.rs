//! Chunk buffering and part assembly.
//!
//! Request bodies arrive as fragments of arbitrary size while the backend
//! wants parts of at least its minimum size. Fragments accumulate in a
//! [`ChunkBuffer`] until a full part is available; once every declared byte
//! has been received the buffer drains into the final parts and the backend
//! session is completed.
//!
//! A part is committed in this order: upload the part, persist the updated
//! record, release the bytes from the buffer. A failure anywhere before the
//! release leaves the record and the buffer as they were, so the next write
//! uploads the same part number again and the backend replaces it.

use crate::error::{EngineError, EngineResult};
use crate::metrics::{BYTES_BUFFERED, BYTES_COMMITTED, PART_UPLOAD_DURATION, PARTS_COMMITTED};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use tusk_core::UploadInfo;
use tusk_metadata::MetadataStore;
use tusk_storage::MultipartStore;

/// Ordered fragments received for one upload and not yet committed.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    fragments: VecDeque<Bytes>,
    len: u64,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffered byte count.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a fragment.
    pub fn push(&mut self, fragment: Bytes) {
        if fragment.is_empty() {
            return;
        }
        let n = fragment.len() as u64;
        self.len += n;
        BYTES_BUFFERED.add(n as i64);
        self.fragments.push_back(fragment);
    }

    /// The first `n` bytes as one contiguous buffer, without consuming them.
    ///
    /// Zero-copy when the first fragment alone covers `n`.
    pub fn peek(&self, n: u64) -> Bytes {
        let n = n.min(self.len) as usize;
        match self.fragments.front() {
            None => Bytes::new(),
            Some(front) if front.len() >= n => front.slice(..n),
            Some(_) => {
                let mut out = BytesMut::with_capacity(n);
                for fragment in &self.fragments {
                    let take = (n - out.len()).min(fragment.len());
                    out.extend_from_slice(&fragment[..take]);
                    if out.len() == n {
                        break;
                    }
                }
                out.freeze()
            }
        }
    }

    /// Release the first `n` bytes.
    pub fn consume(&mut self, n: u64) {
        let n = n.min(self.len);
        let mut remaining = n as usize;
        while remaining > 0 {
            let Some(front) = self.fragments.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                self.fragments.pop_front();
            } else {
                *front = front.slice(remaining..);
                remaining = 0;
            }
        }
        self.len -= n;
        BYTES_BUFFERED.sub(n as i64);
    }

    /// Drop every buffered byte.
    pub fn clear(&mut self) {
        BYTES_BUFFERED.sub(self.len as i64);
        self.fragments.clear();
        self.len = 0;
    }
}

impl Drop for ChunkBuffer {
    fn drop(&mut self) {
        BYTES_BUFFERED.sub(self.len as i64);
    }
}

/// Volatile per-upload state guarded by the slot's state lock.
///
/// `committed` mirrors the record's offset and changes together with the
/// buffer, so `committed + buffer.len()` is always a consistent logical offset.
#[derive(Debug, Default)]
pub struct SessionState {
    pub buffer: ChunkBuffer,
    pub committed: u64,
}

impl SessionState {
    pub fn new(committed: u64) -> Self {
        Self {
            buffer: ChunkBuffer::new(),
            committed,
        }
    }

    /// Bytes received so far: committed plus buffered.
    pub fn logical_offset(&self) -> u64 {
        self.committed + self.buffer.len()
    }
}

/// Result of an assembly pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// More bytes are expected.
    Pending,
    /// The backend session was completed and the record deleted.
    Completed,
}

/// Turns buffered bytes into backend parts.
#[derive(Clone)]
pub struct PartAssembler {
    storage: Arc<dyn MultipartStore>,
    metadata: Arc<dyn MetadataStore>,
    part_size: u64,
}

impl PartAssembler {
    pub fn new(
        storage: Arc<dyn MultipartStore>,
        metadata: Arc<dyn MetadataStore>,
        part_size: u64,
    ) -> Self {
        Self {
            storage,
            metadata,
            part_size,
        }
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Commit every full part that is buffered, or drain once the declared
    /// length has been reached.
    pub async fn maybe_commit(
        &self,
        id: &str,
        info: &mut UploadInfo,
        state: &Mutex<SessionState>,
    ) -> EngineResult<CommitOutcome> {
        let buffered = state.lock().await.buffer.len();

        if let Some(total) = info.total_length
            && info.offset + buffered >= total
        {
            return self.drain(id, info, state).await;
        }

        for _ in 0..buffered / self.part_size {
            self.commit_part(id, info, state, self.part_size).await?;
        }
        Ok(CommitOutcome::Pending)
    }

    /// Commit everything buffered, complete the backend session and delete
    /// the record.
    ///
    /// Full parts are committed while more than one part remains; the rest
    /// becomes the final part, which has no minimum size. Completion happens
    /// on the write that brings the upload to its declared length.
    ///
    /// A record that is complete with nothing buffered, whose session the
    /// backend no longer knows, was finalized by an earlier drain that failed
    /// to delete it; the drain then only deletes the record.
    pub async fn drain(
        &self,
        id: &str,
        info: &mut UploadInfo,
        state: &Mutex<SessionState>,
    ) -> EngineResult<CommitOutcome> {
        let buffered = state.lock().await.buffer.len();
        if let Some(total) = info.total_length
            && info.offset + buffered > total
        {
            return Err(EngineError::ExceedsLength {
                offset: info.offset,
                fragment: buffered,
                length: total,
            });
        }

        let mut remaining = buffered;
        for _ in 0..buffered.div_ceil(self.part_size) {
            let size = remaining.min(self.part_size);
            self.commit_part(id, info, state, size).await?;
            remaining -= size;
        }

        if let Err(e) = self
            .storage
            .complete_session(&info.backend_session_id, id, &info.parts)
            .await
        {
            if !(e.is_not_found() && buffered == 0 && info.is_complete()) {
                return Err(e.into());
            }
            warn!(upload_id = %id, error = %e, "Backend session already completed, removing stale record");
        }
        self.metadata
            .delete(id)
            .await
            .map_err(|e| EngineError::from_record(id, e))?;

        debug!(upload_id = %id, parts = info.part_count, offset = info.offset, "Drained upload");
        Ok(CommitOutcome::Completed)
    }

    async fn commit_part(
        &self,
        id: &str,
        info: &mut UploadInfo,
        state: &Mutex<SessionState>,
        size: u64,
    ) -> EngineResult<()> {
        let data = state.lock().await.buffer.peek(size);
        let part_number = info.next_part_number();

        let timer = PART_UPLOAD_DURATION.start_timer();
        let etag = self
            .storage
            .upload_part(&info.backend_session_id, id, part_number, data)
            .await?;
        timer.observe_duration();

        let mut next = info.clone();
        next.record_part(etag, size);
        self.metadata
            .put(id, &next)
            .await
            .map_err(|e| EngineError::from_record(id, e))?;
        *info = next;

        {
            let mut state = state.lock().await;
            state.buffer.consume(size);
            state.committed = info.offset;
        }

        PARTS_COMMITTED.inc();
        BYTES_COMMITTED.inc_by(size);
        debug!(upload_id = %id, part_number, size, offset = info.offset, "Committed part");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tusk_metadata::SidecarStore;
    use tusk_storage::MemoryBackend;

    fn buffer_of(fragments: &[&'static [u8]]) -> ChunkBuffer {
        let mut buffer = ChunkBuffer::new();
        for fragment in fragments {
            buffer.push(Bytes::from_static(fragment));
        }
        buffer
    }

    #[test]
    fn test_buffer_tracks_length_and_skips_empty_fragments() {
        let mut buffer = buffer_of(&[b"abc", b"", b"de"]);
        assert_eq!(buffer.len(), 5);
        buffer.push(Bytes::new());
        assert_eq!(buffer.len(), 5);
        assert!(!buffer.is_empty());
        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_peek_spans_fragments() {
        let buffer = buffer_of(&[b"ab", b"cde", b"f"]);
        assert_eq!(buffer.peek(1), Bytes::from_static(b"a"));
        assert_eq!(buffer.peek(4), Bytes::from_static(b"abcd"));
        assert_eq!(buffer.peek(6), Bytes::from_static(b"abcdef"));
        // clamps to what is buffered
        assert_eq!(buffer.peek(100), Bytes::from_static(b"abcdef"));
        assert_eq!(buffer.len(), 6);
    }

    #[test]
    fn test_consume_splits_fragment() {
        let mut buffer = buffer_of(&[b"ab", b"cde", b"f"]);
        buffer.consume(3);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.peek(3), Bytes::from_static(b"def"));
        buffer.consume(3);
        assert!(buffer.is_empty());
        assert_eq!(buffer.peek(1), Bytes::new());
    }

    struct Harness {
        backend: Arc<MemoryBackend>,
        metadata: Arc<SidecarStore>,
        assembler: PartAssembler,
    }

    fn harness(part_size: u64) -> Harness {
        let backend = Arc::new(MemoryBackend::new(1));
        let metadata = Arc::new(SidecarStore::new(backend.clone()));
        let assembler = PartAssembler::new(backend.clone(), metadata.clone(), part_size);
        Harness {
            backend,
            metadata,
            assembler,
        }
    }

    async fn open(h: &Harness, id: &str, total: Option<u64>) -> UploadInfo {
        let session = h.backend.open_session(id).await.unwrap();
        let info = UploadInfo::new(session, total, None);
        h.metadata.put(id, &info).await.unwrap();
        info
    }

    #[tokio::test]
    async fn test_threshold_commits_whole_parts_and_keeps_remainder() {
        let h = harness(10);
        let mut info = open(&h, "t", Some(100)).await;
        let state = Mutex::new(SessionState::new(0));
        state.lock().await.buffer.push(Bytes::from(vec![1u8; 35]));

        let outcome = h.assembler.maybe_commit("t", &mut info, &state).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Pending);
        assert_eq!(info.part_count, 3);
        assert_eq!(info.offset, 30);

        let state = state.lock().await;
        assert_eq!(state.committed, 30);
        assert_eq!(state.buffer.len(), 5);
        assert_eq!(
            h.backend.session_part_sizes(&info.backend_session_id).await.unwrap(),
            vec![10, 10, 10]
        );
        assert_eq!(h.metadata.get("t").await.unwrap(), info);
    }

    #[tokio::test]
    async fn test_below_threshold_touches_nothing() {
        let h = harness(10);
        let mut info = open(&h, "t", None).await;
        let state = Mutex::new(SessionState::new(0));
        state.lock().await.buffer.push(Bytes::from(vec![1u8; 9]));

        h.assembler.maybe_commit("t", &mut info, &state).await.unwrap();
        assert_eq!(h.backend.call_counts().upload_part, 0);
        assert_eq!(info.part_count, 0);
    }

    #[tokio::test]
    async fn test_drain_commits_full_parts_then_remainder() {
        let h = harness(10);
        let mut info = open(&h, "d", Some(27)).await;
        let data: Vec<u8> = (0..27u8).collect();
        let state = Mutex::new(SessionState::new(0));
        state.lock().await.buffer.push(Bytes::from(data.clone()));

        let outcome = h.assembler.maybe_commit("d", &mut info, &state).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Completed);
        assert_eq!(info.part_count, 3);
        assert_eq!(info.offset, 27);
        let numbers: Vec<u32> = info.parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);

        assert_eq!(h.backend.object("d").await.unwrap(), Bytes::from(data));
        assert!(h.metadata.get("d").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_short_upload_drains_one_undersized_part() {
        let h = harness(10);
        let mut info = open(&h, "s", Some(4)).await;
        let state = Mutex::new(SessionState::new(0));
        state.lock().await.buffer.push(Bytes::from_static(b"tiny"));

        let outcome = h.assembler.maybe_commit("s", &mut info, &state).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Completed);
        assert_eq!(h.backend.call_counts().upload_part, 1);
        assert_eq!(h.backend.object("s").await.unwrap(), Bytes::from_static(b"tiny"));
    }

    #[tokio::test]
    async fn test_drain_of_empty_upload_completes_without_parts() {
        let h = harness(10);
        let mut info = open(&h, "z", Some(0)).await;
        let state = Mutex::new(SessionState::new(0));

        let outcome = h.assembler.drain("z", &mut info, &state).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Completed);
        assert_eq!(h.backend.call_counts().upload_part, 0);
        assert_eq!(h.backend.object("z").await.unwrap().len(), 0);
    }
}
