//! Folding changes into chunks.
//!
//! [`Persister::persist_changes`] is the chunk-splitting algorithm,
//! [`Persister::persist_buffer`] drains the write buffer through it,
//! [`Persister::queue_changes`] validates and stages new changes, and
//! [`Persister::commit_changes`] dispatches between them by buffer level.

mod buffer;
mod changes;
mod commit;
mod limits;
mod queue;
mod resync;
mod worker;

pub use changes::PersistResult;
pub use commit::{BufferLevel, CommitOptions, CommitResult};
pub use limits::{HashMismatchPolicy, PersistLimits};
pub use resync::{HttpResyncClient, NoResync, RecordingResync, ResyncRequester};
pub use worker::{BufferWorker, WorkerReport};

use crate::blobs::BlobService;
use crate::buffer::WriteBuffer;
use crate::chunks::ChunkStore;
use std::sync::Arc;

/// Drives changes from callers and the write buffer into the chunk store.
pub struct Persister {
    chunks: Arc<ChunkStore>,
    blobs: BlobService,
    buffer: Arc<WriteBuffer>,
    resync: Arc<dyn ResyncRequester>,
    policy: HashMismatchPolicy,
    drain_batch_size: usize,
}

impl Persister {
    pub fn new(
        chunks: Arc<ChunkStore>,
        blobs: BlobService,
        buffer: Arc<WriteBuffer>,
        resync: Arc<dyn ResyncRequester>,
    ) -> Self {
        let drain_batch_size = buffer.settings().drain_batch_size.max(1);
        Self {
            chunks,
            blobs,
            buffer,
            resync,
            policy: HashMismatchPolicy::default(),
            drain_batch_size,
        }
    }

    pub fn with_policy(mut self, policy: HashMismatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn chunks(&self) -> &Arc<ChunkStore> {
        &self.chunks
    }

    pub fn buffer(&self) -> &Arc<WriteBuffer> {
        &self.buffer
    }

    pub fn blobs(&self) -> &BlobService {
        &self.blobs
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::blobs::GlobalBlobs;
    use crate::buffer::KvStore;
    use crate::chunks::{DocumentBackend, MetadataRouter, RelationalBackend};
    use crate::config::BufferSettings;
    use crate::history_store::HistoryStore;
    use crate::storage::MemoryObjectStore;

    pub(crate) struct Fixture {
        pub persister: Persister,
        pub resync: Arc<RecordingResync>,
    }

    pub(crate) fn fixture() -> Fixture {
        let objects = Arc::new(MemoryObjectStore::new());
        let metadata = Arc::new(MetadataRouter::new(
            Arc::new(RelationalBackend::open_in_memory().unwrap()),
            Arc::new(DocumentBackend::in_memory()),
        ));
        let buffer = Arc::new(WriteBuffer::new(Arc::new(KvStore::new(3)), BufferSettings::default()));
        let chunks = Arc::new(
            ChunkStore::new(metadata.clone(), HistoryStore::new(objects.clone(), "chunks"))
                .with_buffer(buffer.clone()),
        );
        let blobs = BlobService::new(
            objects,
            metadata,
            Arc::new(GlobalBlobs::default()),
            "blobs",
            "global-blobs",
            100,
        );
        let resync = Arc::new(RecordingResync::default());
        Fixture {
            persister: Persister::new(chunks, blobs, buffer, resync.clone()),
            resync,
        }
    }
}
