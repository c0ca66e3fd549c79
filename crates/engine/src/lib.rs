//! Resumable upload session engine.
//!
//! Turns a sequence of chunked, possibly interrupted writes into a single
//! object in an S3-style multipart backend:
//! - `create` opens a backend session and writes the upload record
//! - `write` buffers request bodies and commits full parts
//! - `get_offset` reports committed plus buffered bytes
//! - `declare_length` resolves a deferred length
//! - `abort` removes the record and the backend session
//!
//! Lifecycle transitions are broadcast as [`UploadEvent`]s.

pub mod assembler;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;

pub use assembler::{ChunkBuffer, CommitOutcome, PartAssembler, SessionState};
pub use engine::{NewUpload, UploadEngine};
pub use error::{BoxError, EngineError, EngineResult};
pub use events::{EventBus, UploadEvent};
