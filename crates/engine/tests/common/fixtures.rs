use bytes::Bytes;
use futures::Stream;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tusk_core::UploadInfo;
use tusk_core::config::EngineConfig;
use tusk_engine::UploadEngine;
use tusk_metadata::{MetadataStore, SidecarStore};
use tusk_storage::{MemoryBackend, MultipartStore};

/// Part size used by most engine tests.
#[allow(dead_code)]
pub const PART_SIZE: u64 = 5_000_000;

/// Generate deterministic test data using a seeded pseudo-random generator
/// Same seed produces same output (reproducible tests)
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    // Simple LCG (Linear Congruential Generator)
    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Split data into fragments of at most `size` bytes.
#[allow(dead_code)]
pub fn chunked(data: &Bytes, size: usize) -> Vec<Bytes> {
    (0..data.len())
        .step_by(size)
        .map(|start| data.slice(start..(start + size).min(data.len())))
        .collect()
}

/// A request body yielding the given fragments.
pub fn body(fragments: Vec<Bytes>) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
    futures::stream::iter(fragments.into_iter().map(Ok))
}

/// A request body that yields the fragments and then breaks.
#[allow(dead_code)]
pub fn failing_body(
    fragments: Vec<Bytes>,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
    let broken = io::Error::new(io::ErrorKind::ConnectionReset, "client went away");
    futures::stream::iter(
        fragments
            .into_iter()
            .map(Ok)
            .chain(std::iter::once(Err(broken))),
    )
}

/// A request body fed through a channel; it ends when the sender is dropped.
#[allow(dead_code)]
pub fn channel_body() -> (
    mpsc::Sender<Bytes>,
    impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static,
) {
    let (tx, rx) = mpsc::channel::<Bytes>(4);
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|fragment| (Ok(fragment), rx))
    });
    (tx, stream)
}

/// An engine over an in-memory backend, with handles for inspection.
#[allow(dead_code)]
pub struct TestEngine {
    pub engine: Arc<UploadEngine>,
    pub backend: Arc<MemoryBackend>,
    pub metadata: Arc<SidecarStore>,
}

#[allow(dead_code)]
impl TestEngine {
    /// The persisted record of an upload.
    pub async fn record(&self, id: &str) -> UploadInfo {
        self.metadata.get(id).await.expect("record exists")
    }

    /// A second engine over the same backend, as after a restart.
    pub fn restarted(&self) -> Arc<UploadEngine> {
        Arc::new(
            UploadEngine::new(
                self.backend.clone(),
                self.metadata.clone(),
                Arc::new(tusk_core::UuidNamer),
                self.engine.config().clone(),
            )
            .expect("engine builds"),
        )
    }
}

/// Engine with the given part size over a backend whose minimum part size is 1.
#[allow(dead_code)]
pub fn test_engine(part_size: u64) -> TestEngine {
    test_engine_with(EngineConfig {
        part_size,
        ..EngineConfig::default()
    })
}

#[allow(dead_code)]
pub fn test_engine_with(config: EngineConfig) -> TestEngine {
    let backend = Arc::new(MemoryBackend::new(1));
    let metadata = Arc::new(SidecarStore::new(backend.clone() as Arc<dyn MultipartStore>));
    let engine = UploadEngine::new(
        backend.clone(),
        metadata.clone(),
        Arc::new(tusk_core::UuidNamer),
        config,
    )
    .expect("engine builds");
    TestEngine {
        engine: Arc::new(engine),
        backend,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunked_covers_all_bytes() {
        let data = seeded_bytes(1, 10);
        let parts = chunked(&data, 4);
        assert_eq!(parts.iter().map(Bytes::len).collect::<Vec<_>>(), vec![4, 4, 2]);
        assert_eq!(parts.concat(), data.to_vec());
    }
}
