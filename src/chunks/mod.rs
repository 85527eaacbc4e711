//! The chunk ledger.
//!
//! Chunk metadata lives in one of two backends chosen by the history id
//! format; chunk payloads live in the [`HistoryStore`]. Writes are two-phase:
//! a pending row is inserted, the payload is stored, then the row is
//! activated in a transaction that re-checks the version fence.

mod document;
mod relational;

pub use document::DocumentBackend;
pub use relational::RelationalBackend;

use crate::blobs::Blob;
use crate::buffer::WriteBuffer;
use crate::error::{Result, StoreError};
use crate::history_store::{self, HistoryStore};
use crate::model::{Chunk, ChunkRecord, History};
use crate::types::{BlobHash, ChunkId, HistoryId};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle of a chunk row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ChunkState {
    /// Inserted, payload possibly not yet written. Invisible to readers.
    Pending,
    Active,
    /// Superseded by an extended copy of the same range.
    Closed,
}

impl ChunkState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkState::Pending => "pending",
            ChunkState::Active => "active",
            ChunkState::Closed => "closed",
        }
    }
}

/// Metadata index for chunks and blobs.
///
/// Every query over chunks sees only active rows.
pub trait MetadataBackend: Send + Sync {
    fn get_latest_chunk(&self, project_id: &HistoryId) -> Result<Option<ChunkRecord>>;

    /// The first chunk whose end version is at least `version`.
    fn get_chunk_for_version(&self, project_id: &HistoryId, version: u64) -> Result<Option<ChunkRecord>>;

    /// The first chunk ending at or after `timestamp`, else the latest.
    fn get_chunk_for_timestamp(
        &self,
        project_id: &HistoryId,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<ChunkRecord>>;

    /// Up to `limit` chunks with end version at least `from_version`,
    /// ordered by start version.
    fn get_chunks_from_version(
        &self,
        project_id: &HistoryId,
        from_version: u64,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>>;

    /// Ids of every row of the project in any state.
    fn get_all_chunk_ids(&self, project_id: &HistoryId) -> Result<Vec<ChunkId>>;

    fn insert_pending_chunk(&self, project_id: &HistoryId, start_version: u64, end_version: u64) -> Result<ChunkId>;

    /// Activate a pending chunk that starts a new range. Fails with a
    /// conflict if an active chunk already starts there or the range does
    /// not follow the latest chunk.
    fn confirm_create(
        &self,
        project_id: &HistoryId,
        chunk_id: &ChunkId,
        end_timestamp: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Atomically close `old_chunk_id` and activate `new_chunk_id`. Fails
    /// with a conflict unless the old chunk is still the latest and still
    /// ends at `expected_end_version`.
    fn confirm_update(
        &self,
        project_id: &HistoryId,
        expected_end_version: u64,
        old_chunk_id: &ChunkId,
        new_chunk_id: &ChunkId,
        end_timestamp: Option<DateTime<Utc>>,
    ) -> Result<()>;

    fn delete_pending_chunk(&self, project_id: &HistoryId, chunk_id: &ChunkId) -> Result<()>;

    fn delete_project_chunks(&self, project_id: &HistoryId) -> Result<()>;

    fn get_mongo_project_id(&self, project_id: &HistoryId) -> Result<Option<String>>;

    fn set_mongo_project_id(&self, project_id: &HistoryId, mongo_id: &str) -> Result<()>;

    fn insert_blob(&self, project_id: &HistoryId, blob: &Blob) -> Result<()>;

    fn find_blob(&self, project_id: &HistoryId, hash: &BlobHash) -> Result<Option<Blob>>;

    fn find_blobs(&self, project_id: &HistoryId, hashes: &[BlobHash]) -> Result<Vec<Blob>>;

    fn delete_blobs(&self, project_id: &HistoryId) -> Result<()>;
}

/// Picks the metadata backend for a history id.
pub struct MetadataRouter {
    relational: Arc<dyn MetadataBackend>,
    document: Arc<dyn MetadataBackend>,
}

impl MetadataRouter {
    pub fn new(relational: Arc<dyn MetadataBackend>, document: Arc<dyn MetadataBackend>) -> Self {
        Self {
            relational,
            document,
        }
    }

    pub fn for_project(&self, project_id: &HistoryId) -> &dyn MetadataBackend {
        match project_id {
            HistoryId::Postgres(_) => self.relational.as_ref(),
            HistoryId::Mongo(_) => self.document.as_ref(),
        }
    }
}

/// Records fetched per backend round trip when walking a project.
const CHUNK_BATCH_SIZE: usize = 100;

/// The authoritative, version-ordered ledger of chunks.
pub struct ChunkStore {
    metadata: Arc<MetadataRouter>,
    history: HistoryStore,
    buffer: Option<Arc<WriteBuffer>>,
}

impl ChunkStore {
    pub fn new(metadata: Arc<MetadataRouter>, history: HistoryStore) -> Self {
        Self {
            metadata,
            history,
            buffer: None,
        }
    }

    /// Let [`ChunkStore::load_latest`] overlay buffered changes.
    pub fn with_buffer(mut self, buffer: Arc<WriteBuffer>) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub fn history_store(&self) -> &HistoryStore {
        &self.history
    }

    fn backend(&self, project_id: &HistoryId) -> &dyn MetadataBackend {
        self.metadata.for_project(project_id)
    }

    /// Create the empty first chunk if the project has none.
    pub fn initialize_project(&self, project_id: &HistoryId) -> Result<()> {
        if self.backend(project_id).get_latest_chunk(project_id)?.is_some() {
            return Ok(());
        }
        self.create(project_id, &Chunk::new(History::default(), 0))?;
        Ok(())
    }

    pub fn get_latest_chunk_metadata(&self, project_id: &HistoryId) -> Result<Option<ChunkRecord>> {
        self.backend(project_id).get_latest_chunk(project_id)
    }

    /// Load the latest chunk. Unless `persisted_only`, changes still waiting
    /// in the write buffer are appended to it.
    pub fn load_latest(&self, project_id: &HistoryId, persisted_only: bool) -> Result<Chunk> {
        let record = self
            .get_latest_chunk_metadata(project_id)?
            .ok_or_else(|| StoreError::NotFound(format!("no chunks for project {project_id}")))?;
        let mut chunk = self.load_by_record(project_id, &record)?;
        if !persisted_only {
            if let Some(buffer) = &self.buffer {
                let pending =
                    buffer.get_non_persisted_changes(project_id, chunk.end_version(), None)?;
                for change in pending {
                    chunk.push_change(change);
                }
            }
        }
        Ok(chunk)
    }

    pub fn load_at_version(&self, project_id: &HistoryId, version: u64) -> Result<Chunk> {
        let record = self
            .backend(project_id)
            .get_chunk_for_version(project_id, version)?
            .ok_or_else(|| {
                StoreError::NotFound(format!("no chunk for version {version} of project {project_id}"))
            })?;
        self.load_by_record(project_id, &record)
    }

    pub fn load_at_timestamp(&self, project_id: &HistoryId, timestamp: DateTime<Utc>) -> Result<Chunk> {
        let record = self
            .backend(project_id)
            .get_chunk_for_timestamp(project_id, timestamp)?
            .ok_or_else(|| StoreError::NotFound(format!("no chunks for project {project_id}")))?;
        self.load_by_record(project_id, &record)
    }

    pub fn load_by_record(&self, project_id: &HistoryId, record: &ChunkRecord) -> Result<Chunk> {
        let history = self.history.load_raw(project_id, &record.id)?;
        let chunk = Chunk::new(history, record.start_version);
        if chunk.end_version() != record.end_version {
            return Err(StoreError::Corruption(format!(
                "chunk {} of project {project_id} ends at {}, metadata says {}",
                record.id,
                chunk.end_version(),
                record.end_version
            )));
        }
        Ok(chunk)
    }

    /// The stored compressed payload of a chunk together with its parse.
    pub fn load_buffer_by_record(&self, project_id: &HistoryId, record: &ChunkRecord) -> Result<(Chunk, Vec<u8>)> {
        let buffer = self.history.load_raw_with_buffer(project_id, &record.id)?;
        let history = history_store::decode(&buffer)
            .map_err(|e| StoreError::load(format!("chunk {} of project {project_id}", record.id), e))?;
        Ok((Chunk::new(history, record.start_version), buffer))
    }

    /// Lazily walk the chunks that contain versions at or after
    /// `from_version`.
    pub fn get_project_chunks_from_version(&self, project_id: &HistoryId, from_version: u64) -> ChunkRecords<'_> {
        ChunkRecords {
            backend: self.backend(project_id),
            project_id: project_id.clone(),
            next_version: from_version,
            batch: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn get_project_chunks(&self, project_id: &HistoryId) -> Result<Vec<ChunkRecord>> {
        self.get_project_chunks_from_version(project_id, 0).collect()
    }

    /// Store a chunk that starts a new range after the latest chunk.
    pub fn create(&self, project_id: &HistoryId, chunk: &Chunk) -> Result<ChunkRecord> {
        let backend = self.backend(project_id);
        let chunk_id = backend.insert_pending_chunk(project_id, chunk.start_version(), chunk.end_version())?;
        self.store_pending(project_id, &chunk_id, chunk)?;
        if let Err(e) = backend.confirm_create(project_id, &chunk_id, chunk.end_timestamp()) {
            self.discard_pending(project_id, &chunk_id);
            return Err(e);
        }
        debug!(%project_id, %chunk_id, start = chunk.start_version(), end = chunk.end_version(), "created chunk");
        Ok(record_for(chunk_id, chunk))
    }

    /// Replace the latest chunk with an extended copy. Fails with
    /// [`StoreError::ChunkVersionConflict`] if the latest chunk no longer
    /// ends at `expected_end_version`.
    pub fn update(&self, project_id: &HistoryId, expected_end_version: u64, chunk: &Chunk) -> Result<ChunkRecord> {
        let backend = self.backend(project_id);
        let latest = backend
            .get_latest_chunk(project_id)?
            .ok_or_else(|| StoreError::NotFound(format!("no chunks for project {project_id}")))?;
        if latest.end_version != expected_end_version || latest.start_version != chunk.start_version() {
            return Err(StoreError::ChunkVersionConflict {
                project_id: project_id.to_string(),
                detail: format!(
                    "expected latest chunk {}..{expected_end_version}, found {}..{}",
                    chunk.start_version(),
                    latest.start_version,
                    latest.end_version
                ),
            });
        }

        let chunk_id = backend.insert_pending_chunk(project_id, chunk.start_version(), chunk.end_version())?;
        self.store_pending(project_id, &chunk_id, chunk)?;
        if let Err(e) = backend.confirm_update(
            project_id,
            expected_end_version,
            &latest.id,
            &chunk_id,
            chunk.end_timestamp(),
        ) {
            self.discard_pending(project_id, &chunk_id);
            return Err(e);
        }
        debug!(%project_id, old = %latest.id, new = %chunk_id, end = chunk.end_version(), "updated chunk");
        Ok(record_for(chunk_id, chunk))
    }

    fn store_pending(&self, project_id: &HistoryId, chunk_id: &ChunkId, chunk: &Chunk) -> Result<()> {
        if let Err(e) = self.history.store_raw(project_id, chunk_id, chunk.history()) {
            if let Err(cleanup) = self.backend(project_id).delete_pending_chunk(project_id, chunk_id) {
                warn!(%project_id, %chunk_id, error = %cleanup, "failed to remove pending chunk");
            }
            return Err(e);
        }
        Ok(())
    }

    fn discard_pending(&self, project_id: &HistoryId, chunk_id: &ChunkId) {
        if let Err(e) = self
            .history
            .delete_chunks(&[(project_id.clone(), chunk_id.clone())])
        {
            warn!(%project_id, %chunk_id, error = %e, "failed to remove orphaned chunk payload");
        }
        if let Err(e) = self.backend(project_id).delete_pending_chunk(project_id, chunk_id) {
            warn!(%project_id, %chunk_id, error = %e, "failed to remove pending chunk");
        }
    }

    /// Hard-delete every chunk row and payload of a project.
    pub fn delete_project_chunks(&self, project_id: &HistoryId) -> Result<()> {
        let backend = self.backend(project_id);
        let ids = backend.get_all_chunk_ids(project_id)?;
        let targets: Vec<_> = ids.into_iter().map(|id| (project_id.clone(), id)).collect();
        self.history.delete_chunks(&targets)?;
        backend.delete_project_chunks(project_id)
    }

    /// The web project id a history belongs to. Document-backend ids are
    /// already web project ids.
    pub fn resolve_history_id_to_mongo_project_id(&self, project_id: &HistoryId) -> Result<Option<String>> {
        match project_id {
            HistoryId::Mongo(id) => Ok(Some(id.clone())),
            HistoryId::Postgres(_) => self.backend(project_id).get_mongo_project_id(project_id),
        }
    }

    pub fn set_mongo_project_id(&self, project_id: &HistoryId, mongo_id: &str) -> Result<()> {
        self.backend(project_id).set_mongo_project_id(project_id, mongo_id)
    }
}

fn record_for(id: ChunkId, chunk: &Chunk) -> ChunkRecord {
    ChunkRecord {
        id,
        start_version: chunk.start_version(),
        end_version: chunk.end_version(),
        end_timestamp: chunk.end_timestamp(),
    }
}

/// Forward-only walk over a project's chunk records, fetched in batches.
///
/// Restart a walk by calling
/// [`ChunkStore::get_project_chunks_from_version`] with [`Self::position`].
pub struct ChunkRecords<'a> {
    backend: &'a dyn MetadataBackend,
    project_id: HistoryId,
    next_version: u64,
    batch: VecDeque<ChunkRecord>,
    exhausted: bool,
}

impl ChunkRecords<'_> {
    /// First version not yet covered by a yielded record.
    pub fn position(&self) -> u64 {
        self.next_version
    }
}

impl Iterator for ChunkRecords<'_> {
    type Item = Result<ChunkRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.batch.is_empty() && !self.exhausted {
            match self
                .backend
                .get_chunks_from_version(&self.project_id, self.next_version, CHUNK_BATCH_SIZE)
            {
                Ok(records) => {
                    self.exhausted = records.len() < CHUNK_BATCH_SIZE;
                    self.batch.extend(records);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        let record = self.batch.pop_front()?;
        self.next_version = record.end_version + 1;
        Some(Ok(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Change, File, Operation};
    use crate::storage::{MemoryObjectStore, ObjectStore};

    struct FailingObjects;

    impl ObjectStore for FailingObjects {
        fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
            Err(crate::storage::not_found(bucket, key))
        }
        fn put(&self, _: &str, _: &str, _: &[u8]) -> Result<()> {
            Err(StoreError::Io(std::io::Error::other("bucket unavailable")))
        }
        fn delete(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn list(&self, _: &str, _: &str) -> Result<Vec<crate::storage::ObjectInfo>> {
            Ok(Vec::new())
        }
        fn exists(&self, _: &str, _: &str) -> Result<bool> {
            Ok(false)
        }
    }

    fn chunk_store(objects: Arc<dyn ObjectStore>) -> ChunkStore {
        let metadata = Arc::new(MetadataRouter::new(
            Arc::new(RelationalBackend::open_in_memory().unwrap()),
            Arc::new(DocumentBackend::in_memory()),
        ));
        ChunkStore::new(metadata, HistoryStore::new(objects, "chunks"))
    }

    fn projects() -> Vec<HistoryId> {
        vec![
            HistoryId::Postgres(1),
            HistoryId::parse("5fa1b2c3d4e5f60718293a4b").unwrap(),
        ]
    }

    fn chunk_with(start: u64, changes: usize) -> Chunk {
        let mut chunk = Chunk::new(History::default(), start);
        for i in 0..changes {
            chunk.push_change(Change::new(
                vec![Operation::add_file(format!("f{start}-{i}"), File::from_string("x"))],
                Utc::now(),
            ));
        }
        chunk
    }

    #[test]
    fn test_create_and_load() {
        let store = chunk_store(Arc::new(MemoryObjectStore::new()));
        for project in projects() {
            store.initialize_project(&project).unwrap();
            let latest = store.load_latest(&project, true).unwrap();
            assert_eq!(latest.end_version(), 0);

            store.create(&project, &chunk_with(0, 3)).unwrap_err();
            store.update(&project, 0, &chunk_with(0, 3)).unwrap();
            store.create(&project, &chunk_with(3, 2)).unwrap();

            assert_eq!(store.load_latest(&project, true).unwrap().end_version(), 5);
            assert_eq!(store.load_at_version(&project, 2).unwrap().start_version(), 0);
            assert_eq!(store.load_at_version(&project, 3).unwrap().start_version(), 0);
            assert_eq!(store.load_at_version(&project, 4).unwrap().start_version(), 3);
            assert!(store.load_at_version(&project, 6).unwrap_err().is_not_found());
        }
    }

    #[test]
    fn test_same_start_version_conflicts() {
        let store = chunk_store(Arc::new(MemoryObjectStore::new()));
        for project in projects() {
            store.create(&project, &chunk_with(0, 3)).unwrap();
            let err = store.create(&project, &chunk_with(0, 4)).unwrap_err();
            assert!(matches!(err, StoreError::ChunkVersionConflict { .. }), "{err}");
            store.create(&project, &chunk_with(3, 1)).unwrap();
        }
    }

    #[test]
    fn test_stale_update_conflicts_without_change() {
        let store = chunk_store(Arc::new(MemoryObjectStore::new()));
        for project in projects() {
            store.create(&project, &chunk_with(0, 2)).unwrap();
            let err = store.update(&project, 1, &chunk_with(0, 3)).unwrap_err();
            assert!(err.is_conflict());
            assert_eq!(store.load_latest(&project, true).unwrap().end_version(), 2);
            assert_eq!(store.get_project_chunks(&project).unwrap().len(), 1);
        }
    }

    #[test]
    fn test_failed_payload_write_creates_no_chunk() {
        let store = chunk_store(Arc::new(FailingObjects));
        for project in projects() {
            assert!(store.create(&project, &chunk_with(0, 1)).is_err());
            assert_eq!(store.get_latest_chunk_metadata(&project).unwrap(), None);
            assert!(store.get_project_chunks(&project).unwrap().is_empty());
        }
    }

    #[test]
    fn test_walk_from_version() {
        let store = chunk_store(Arc::new(MemoryObjectStore::new()));
        let project = HistoryId::Postgres(9);
        store.create(&project, &chunk_with(0, 2)).unwrap();
        store.create(&project, &chunk_with(2, 2)).unwrap();
        store.create(&project, &chunk_with(4, 1)).unwrap();

        let starts: Vec<u64> = store
            .get_project_chunks_from_version(&project, 3)
            .map(|r| r.unwrap().start_version)
            .collect();
        assert_eq!(starts, vec![2, 4]);

        let mut walk = store.get_project_chunks_from_version(&project, 0);
        walk.next().unwrap().unwrap();
        let resumed: Vec<u64> = store
            .get_project_chunks_from_version(&project, walk.position())
            .map(|r| r.unwrap().start_version)
            .collect();
        assert_eq!(resumed, vec![2, 4]);
    }

    #[test]
    fn test_load_at_timestamp() {
        let store = chunk_store(Arc::new(MemoryObjectStore::new()));
        let project = HistoryId::Postgres(3);
        let first = chunk_with(0, 1);
        store.create(&project, &first).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.create(&project, &chunk_with(1, 1)).unwrap();

        let before = first.end_timestamp().unwrap() - chrono::Duration::seconds(1);
        assert_eq!(store.load_at_timestamp(&project, before).unwrap().start_version(), 0);
        let after = Utc::now() + chrono::Duration::seconds(60);
        assert_eq!(store.load_at_timestamp(&project, after).unwrap().start_version(), 1);
    }

    #[test]
    fn test_mongo_id_resolution() {
        let store = chunk_store(Arc::new(MemoryObjectStore::new()));
        let mongo = HistoryId::parse("5fa1b2c3d4e5f60718293a4b").unwrap();
        assert_eq!(
            store.resolve_history_id_to_mongo_project_id(&mongo).unwrap(),
            Some("5fa1b2c3d4e5f60718293a4b".to_string())
        );
        let legacy = HistoryId::Postgres(12);
        assert_eq!(store.resolve_history_id_to_mongo_project_id(&legacy).unwrap(), None);
        store.set_mongo_project_id(&legacy, "000000000000000000000abc").unwrap();
        assert_eq!(
            store.resolve_history_id_to_mongo_project_id(&legacy).unwrap(),
            Some("000000000000000000000abc".to_string())
        );
    }

    #[test]
    fn test_delete_project_chunks() {
        let objects = Arc::new(MemoryObjectStore::new());
        let store = chunk_store(objects.clone());
        let project = HistoryId::Postgres(4);
        store.create(&project, &chunk_with(0, 1)).unwrap();
        store.update(&project, 1, &chunk_with(0, 2)).unwrap();
        store.delete_project_chunks(&project).unwrap();
        assert_eq!(store.get_latest_chunk_metadata(&project).unwrap(), None);
        assert_eq!(objects.object_count(), 0);
    }
}
