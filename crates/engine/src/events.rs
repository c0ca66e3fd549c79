//! Upload lifecycle events.

use tokio::sync::broadcast;
use tusk_core::UploadFile;

/// A lifecycle transition of an upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadEvent {
    /// The upload was created and its record written.
    FileCreated { file: UploadFile },
    /// Every byte was committed and the object finalized.
    UploadComplete { file: UploadFile },
    /// The upload was aborted and its record and backend session removed.
    UploadTerminated { id: String },
}

impl UploadEvent {
    /// Identifier of the upload the event concerns.
    pub fn id(&self) -> &str {
        match self {
            Self::FileCreated { file } | Self::UploadComplete { file } => &file.id,
            Self::UploadTerminated { id } => id,
        }
    }

    /// Short name of the event kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FileCreated { .. } => "file_created",
            Self::UploadComplete { .. } => "upload_complete",
            Self::UploadTerminated { .. } => "upload_terminated",
        }
    }
}

/// Fan-out of lifecycle events to any number of subscribers.
///
/// Emitting never blocks. Subscribers that lag more than the channel capacity
/// behind observe `RecvError::Lagged` and miss the overwritten events.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<UploadEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: UploadEvent) {
        let kind = event.kind();
        // no receivers is not an error
        if self.sender.send(event).is_err() {
            tracing::trace!(event = kind, "No event subscribers");
        }
    }
}
