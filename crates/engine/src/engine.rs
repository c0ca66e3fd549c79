//! The upload session engine.

use crate::assembler::{CommitOutcome, PartAssembler, SessionState};
use crate::error::{BoxError, EngineError, EngineResult};
use crate::events::{EventBus, UploadEvent};
use crate::metrics::{
    ACTIVE_UPLOADS, UPLOADS_ABORTED, UPLOADS_COMPLETED, UPLOADS_CREATED, record_upload_error,
    register_metrics,
};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, instrument, warn};
use tusk_core::config::{AppConfig, EngineConfig};
use tusk_core::naming::validate_id;
use tusk_core::upload::parse_length_value;
use tusk_core::{Namer, NamingError, UploadFile, UploadInfo, UploadStatus, UuidNamer};
use tusk_metadata::MetadataStore;
use tusk_storage::MultipartStore;

/// A creation request as decoded by a protocol front end.
#[derive(Clone, Debug, Default)]
pub struct NewUpload {
    /// Declared length, unparsed (e.g. the `Upload-Length` header).
    pub upload_length: Option<String>,
    /// Whether the client will declare the length later.
    pub defer_length: bool,
    /// Opaque client metadata, stored verbatim.
    pub metadata: Option<String>,
    /// Hint passed to the naming function.
    pub id_hint: Option<String>,
}

impl NewUpload {
    pub fn with_length(length: u64) -> Self {
        Self {
            upload_length: Some(length.to_string()),
            ..Self::default()
        }
    }

    pub fn deferred() -> Self {
        Self {
            defer_length: true,
            ..Self::default()
        }
    }

    pub fn metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    pub fn id_hint(mut self, hint: impl Into<String>) -> Self {
        self.id_hint = Some(hint.into());
        self
    }
}

/// In-process state of one upload.
///
/// `writer` admits a single client request at a time. `commit` is held for
/// every record or backend mutation, including abort, and turns `true` once
/// the upload is aborted. `state` is held only briefly, so offset queries
/// never wait on a client's body stream.
#[derive(Debug)]
struct UploadSlot {
    writer: Mutex<()>,
    commit: Mutex<bool>,
    state: Mutex<SessionState>,
}

impl UploadSlot {
    fn new(committed: u64) -> Self {
        Self {
            writer: Mutex::new(()),
            commit: Mutex::new(false),
            state: Mutex::new(SessionState::new(committed)),
        }
    }
}

/// Upload session engine.
///
/// Owns the session table of every upload this process is serving. Buffered
/// bytes live only here: a deployment that runs several engines must route
/// all requests for one upload to the same engine, otherwise each engine only
/// resumes from the committed offset in the record.
pub struct UploadEngine {
    storage: Arc<dyn MultipartStore>,
    metadata: Arc<dyn MetadataStore>,
    namer: Arc<dyn Namer>,
    assembler: PartAssembler,
    sessions: DashMap<String, Arc<UploadSlot>>,
    events: EventBus,
    config: EngineConfig,
}

impl std::fmt::Debug for UploadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadEngine")
            .field("backend", &self.storage.backend_name())
            .field("sessions", &self.sessions.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn observe<T>(result: EngineResult<T>) -> EngineResult<T> {
    if let Err(e) = &result {
        record_upload_error(e.code());
    }
    result
}

impl UploadEngine {
    /// Create an engine over a backend and a metadata store.
    ///
    /// Fails if the configured part size is below the backend minimum.
    pub fn new(
        storage: Arc<dyn MultipartStore>,
        metadata: Arc<dyn MetadataStore>,
        namer: Arc<dyn Namer>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config
            .validate(storage.min_part_size())
            .map_err(EngineError::Config)?;
        register_metrics();

        Ok(Self {
            assembler: PartAssembler::new(storage.clone(), metadata.clone(), config.part_size),
            storage,
            metadata,
            namer,
            sessions: DashMap::new(),
            events: EventBus::new(config.event_capacity),
            config,
        })
    }

    /// Build the configured backend and sidecar store and an engine over them,
    /// naming uploads with random UUIDs.
    pub async fn from_config(config: &AppConfig) -> EngineResult<Self> {
        let storage = tusk_storage::from_config(&config.storage).await?;
        let metadata = tusk_metadata::from_storage(storage.clone());
        info!(
            backend = storage.backend_name(),
            part_size = config.engine.part_size,
            "Upload engine configured"
        );
        Self::new(storage, metadata, Arc::new(UuidNamer), config.engine.clone())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Receive lifecycle events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    /// Verify the backend is reachable.
    pub async fn health_check(&self) -> EngineResult<()> {
        self.storage.health_check().await?;
        Ok(())
    }

    /// Start a new upload.
    #[instrument(skip(self, request), fields(backend = self.storage.backend_name()))]
    pub async fn create(&self, request: NewUpload) -> EngineResult<UploadFile> {
        observe(self.create_inner(request).await)
    }

    async fn create_inner(&self, request: NewUpload) -> EngineResult<UploadFile> {
        let total_length =
            tusk_core::parse_upload_length(request.upload_length.as_deref(), request.defer_length)?;
        if let Some(length) = total_length {
            self.check_max_size(length)?;
        }

        let id = self.namer.name(request.id_hint.as_deref())?;
        validate_id(&id)?;
        match self.metadata.get(&id).await {
            Ok(_) => {
                return Err(NamingError::new(format!("upload {id:?} already exists")).into());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let session_id = self.storage.open_session(&id).await?;
        let mut info = UploadInfo::new(session_id, total_length, request.metadata);
        if let Err(e) = self.metadata.put(&id, &info).await {
            if let Err(abort_err) = self
                .storage
                .abort_session(&info.backend_session_id, &id)
                .await
            {
                warn!(
                    upload_id = %id,
                    error = %abort_err,
                    "Failed to abort backend session after record write failed"
                );
            }
            return Err(e.into());
        }

        let file = info.to_file(&id);
        let slot = self.slot_for(&id, &info);
        UPLOADS_CREATED.inc();
        info!(upload_id = %id, length = ?total_length, "Upload created");
        self.events.emit(UploadEvent::FileCreated { file: file.clone() });

        if total_length == Some(0) {
            let _commit = slot.commit.lock().await;
            self.assembler.drain(&id, &mut info, &slot.state).await?;
            self.finish(&id, &slot, &info);
        }

        Ok(file)
    }

    /// Append a request body to an upload and return the new offset.
    ///
    /// `starting_offset` must equal the current offset. Every fragment is
    /// buffered as it arrives; full parts are committed once the body ends.
    #[instrument(skip(self, body), fields(upload_id = %id))]
    pub async fn write<S, E>(&self, id: &str, starting_offset: u64, body: S) -> EngineResult<u64>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Into<BoxError>,
    {
        observe(self.write_inner(id, starting_offset, body).await)
    }

    async fn write_inner<S, E>(&self, id: &str, starting_offset: u64, body: S) -> EngineResult<u64>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Into<BoxError>,
    {
        let info = self.load_record(id).await?;
        let slot = self.slot_for(id, &info);
        let _writer = slot
            .writer
            .try_lock()
            .map_err(|_| EngineError::Locked(id.to_string()))?;

        let current = slot.state.lock().await.logical_offset();
        if current != starting_offset {
            return Err(EngineError::OffsetMismatch {
                expected: current,
                actual: starting_offset,
            });
        }

        let mut body = std::pin::pin!(body);
        while let Some(item) = body.next().await {
            let fragment = item.map_err(|e| EngineError::Stream(e.into()))?;
            if fragment.is_empty() {
                continue;
            }

            let mut state = slot.state.lock().await;
            let offset = state.logical_offset();
            let size = fragment.len() as u64;
            if let Some(length) = info.total_length
                && offset + size > length
            {
                return Err(EngineError::ExceedsLength {
                    offset,
                    fragment: size,
                    length,
                });
            }
            state.buffer.push(fragment);
        }

        let commit = slot.commit.lock().await;
        if *commit {
            return Err(EngineError::FileNotFound(id.to_string()));
        }
        // the upload may have been aborted while the body was streaming
        let mut info = match self.load_record(id).await {
            Ok(info) => info,
            Err(e) => {
                self.discard_slot(id, &slot);
                return Err(e);
            }
        };

        match self.assembler.maybe_commit(id, &mut info, &slot.state).await? {
            CommitOutcome::Completed => {
                self.finish(id, &slot, &info);
                Ok(info.offset)
            }
            CommitOutcome::Pending => {
                drop(commit);
                Ok(slot.state.lock().await.logical_offset())
            }
        }
    }

    /// Report how many bytes of an upload have been received.
    #[instrument(skip(self), fields(upload_id = %id))]
    pub async fn get_offset(&self, id: &str) -> EngineResult<UploadStatus> {
        observe(self.get_offset_inner(id).await)
    }

    async fn get_offset_inner(&self, id: &str) -> EngineResult<UploadStatus> {
        let info = self.load_record(id).await?;
        let offset = match self.slot(id) {
            Some(slot) => slot.state.lock().await.logical_offset(),
            None => info.offset,
        };
        Ok(UploadStatus {
            file: info.to_file(id),
            offset,
        })
    }

    /// Declare the length of an upload created with a deferred length.
    ///
    /// Completion happens on the next write, which may carry no bytes.
    #[instrument(skip(self), fields(upload_id = %id))]
    pub async fn declare_length(&self, id: &str, upload_length: &str) -> EngineResult<UploadFile> {
        observe(self.declare_length_inner(id, upload_length).await)
    }

    async fn declare_length_inner(&self, id: &str, upload_length: &str) -> EngineResult<UploadFile> {
        let info = self.load_record(id).await?;
        let slot = self.slot_for(id, &info);
        let _writer = slot
            .writer
            .try_lock()
            .map_err(|_| EngineError::Locked(id.to_string()))?;

        let commit = slot.commit.lock().await;
        if *commit {
            return Err(EngineError::FileNotFound(id.to_string()));
        }
        // re-read under the commit lock
        let mut info = self.load_record(id).await?;
        if let Some(existing) = info.total_length {
            return Err(EngineError::InvalidLength(format!(
                "length already declared as {existing}"
            )));
        }
        let length = parse_length_value(upload_length)?;
        self.check_max_size(length)?;

        let offset = slot.state.lock().await.logical_offset();
        if length < offset {
            return Err(EngineError::InvalidLength(format!(
                "length {length} is below the {offset} bytes already received"
            )));
        }

        info.total_length = Some(length);
        info.defer_length = false;
        self.metadata
            .put(id, &info)
            .await
            .map_err(|e| EngineError::from_record(id, e))?;
        drop(commit);

        info!(upload_id = %id, length, "Upload length declared");
        Ok(info.to_file(id))
    }

    /// Abort an upload: drop its buffer, delete its record and abort the
    /// backend session.
    ///
    /// Waits for an in-flight part commit, so a write never persists its
    /// record after the abort deleted it. A body that is still streaming is
    /// not waited for; its write fails with `FileNotFound` when it ends.
    /// Both deletions are attempted even if one fails; nothing is rolled back.
    #[instrument(skip(self), fields(upload_id = %id))]
    pub async fn abort(&self, id: &str) -> EngineResult<()> {
        observe(self.abort_inner(id).await)
    }

    async fn abort_inner(&self, id: &str) -> EngineResult<()> {
        let info = self.load_record(id).await?;
        let slot = self.slot_for(id, &info);
        let mut terminated = slot.commit.lock().await;

        // a write may have completed the upload while we waited
        let info = match self.load_record(id).await {
            Ok(info) => info,
            Err(e) => {
                self.discard_slot(id, &slot);
                return Err(e);
            }
        };
        *terminated = true;
        slot.state.lock().await.buffer.clear();

        let (record, backend) = tokio::join!(
            self.metadata.delete(id),
            self.storage.abort_session(&info.backend_session_id, id),
        );
        self.discard_slot(id, &slot);
        drop(terminated);

        match (record, backend) {
            (Ok(()), Ok(())) => {
                UPLOADS_ABORTED.inc();
                info!(upload_id = %id, "Upload aborted");
                self.events.emit(UploadEvent::UploadTerminated { id: id.to_string() });
                Ok(())
            }
            (Err(e), Ok(())) => Err(EngineError::from_record(id, e)),
            (Ok(()), Err(e)) => Err(e.into()),
            (Err(record_err), Err(backend_err)) => {
                warn!(
                    upload_id = %id,
                    error = %backend_err,
                    "Backend session abort failed alongside record deletion"
                );
                Err(EngineError::from_record(id, record_err))
            }
        }
    }

    async fn load_record(&self, id: &str) -> EngineResult<UploadInfo> {
        self.metadata
            .get(id)
            .await
            .map_err(|e| EngineError::from_record(id, e))
    }

    fn check_max_size(&self, length: u64) -> EngineResult<()> {
        match self.config.max_upload_size {
            Some(max) if length > max => Err(EngineError::EntityTooLarge { length, max }),
            _ => Ok(()),
        }
    }

    fn slot(&self, id: &str) -> Option<Arc<UploadSlot>> {
        self.sessions.get(id).map(|slot| Arc::clone(slot.value()))
    }

    /// The slot for `id`, rebuilt from the record if this process has none.
    fn slot_for(&self, id: &str, info: &UploadInfo) -> Arc<UploadSlot> {
        if let Some(slot) = self.slot(id) {
            return slot;
        }
        let slot = Arc::clone(
            self.sessions
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(UploadSlot::new(info.offset)))
                .value(),
        );
        ACTIVE_UPLOADS.set(self.sessions.len() as i64);
        slot
    }

    fn discard_slot(&self, id: &str, slot: &Arc<UploadSlot>) {
        self.sessions
            .remove_if(id, |_, current| Arc::ptr_eq(current, slot));
        ACTIVE_UPLOADS.set(self.sessions.len() as i64);
    }

    fn finish(&self, id: &str, slot: &Arc<UploadSlot>, info: &UploadInfo) {
        self.discard_slot(id, slot);
        UPLOADS_COMPLETED.inc();
        info!(upload_id = %id, length = info.offset, parts = info.part_count, "Upload complete");
        self.events.emit(UploadEvent::UploadComplete {
            file: info.to_file(id),
        });
    }
}
