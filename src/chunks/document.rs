//! Document-style metadata backend for object-id history ids.
//!
//! Collections are kept in memory and, when opened on a path, rewritten
//! atomically to a single MessagePack file after every mutation. The file
//! layout is:
//!
//! ```text
//! magic (4) | version (1) | length (4, LE) | body | crc32 (4, LE)
//! ```

use crate::blobs::Blob;
use crate::chunks::{ChunkState, MetadataBackend};
use crate::error::{Result, StoreError};
use crate::model::ChunkRecord;
use crate::types::{BlobHash, ChunkId, HistoryId};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

const DOC_MAGIC: &[u8; 4] = b"HDB\0";
const DOC_VERSION: u8 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ChunkDoc {
    id: String,
    project_id: String,
    start_version: u64,
    end_version: u64,
    end_timestamp: Option<DateTime<Utc>>,
    state: ChunkState,
}

impl ChunkDoc {
    fn record(&self) -> ChunkRecord {
        ChunkRecord {
            id: ChunkId(self.id.clone()),
            start_version: self.start_version,
            end_version: self.end_version,
            end_timestamp: self.end_timestamp,
        }
    }

    fn is_active_in(&self, project_id: &str) -> bool {
        self.state == ChunkState::Active && self.project_id == project_id
    }
}

#[derive(Default, Serialize, Deserialize)]
struct Collections {
    chunks: BTreeMap<String, ChunkDoc>,
    /// project id -> blob hash (hex) -> metadata
    blobs: BTreeMap<String, BTreeMap<String, Blob>>,
}

impl Collections {
    fn active<'a>(&'a self, project_id: &'a str) -> impl Iterator<Item = &'a ChunkDoc> + 'a {
        self.chunks.values().filter(move |c| c.is_active_in(project_id))
    }

    fn latest<'s>(&'s self, project_id: &str) -> Option<&'s ChunkDoc> {
        self.chunks
            .values()
            .filter(|c| c.is_active_in(project_id))
            .max_by_key(|c| c.end_version)
    }
}

pub struct DocumentBackend {
    path: Option<PathBuf>,
    _lock: Option<File>,
    collections: RwLock<Collections>,
    counter: AtomicU32,
}

impl DocumentBackend {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            _lock: None,
            collections: RwLock::new(Collections::default()),
            counter: AtomicU32::new(rand::random()),
        }
    }

    /// Open or create the backend file at `path`. Fails with
    /// [`StoreError::Locked`] if another process holds it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lock_file = File::create(path.with_extension("lock"))?;
        lock_file.try_lock_exclusive().map_err(|_| StoreError::Locked)?;

        let collections = if path.exists() {
            read_file(&path)?
        } else {
            Collections::default()
        };

        Ok(Self {
            path: Some(path),
            _lock: Some(lock_file),
            collections: RwLock::new(collections),
            counter: AtomicU32::new(rand::random()),
        })
    }

    /// Object-id style identifier: seconds, random, counter.
    fn next_id(&self) -> String {
        let secs = Utc::now().timestamp() as u32;
        let random: [u8; 5] = rand::random();
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut bytes = Vec::with_capacity(12);
        bytes.extend_from_slice(&secs.to_be_bytes());
        bytes.extend_from_slice(&random);
        bytes.extend_from_slice(&count.to_be_bytes()[1..]);
        hex::encode(bytes)
    }

    fn read<T>(&self, f: impl FnOnce(&Collections) -> T) -> T {
        f(&self.collections.read())
    }

    /// Run a mutation and persist the result. The closure must validate
    /// before it changes anything.
    fn mutate<T>(&self, f: impl FnOnce(&mut Collections) -> Result<T>) -> Result<T> {
        let mut collections = self.collections.write();
        let out = f(&mut collections)?;
        if let Some(path) = &self.path {
            write_file(path, &collections)?;
        }
        Ok(out)
    }
}

fn mongo_id(project_id: &HistoryId) -> Result<&str> {
    match project_id {
        HistoryId::Mongo(id) => Ok(id.as_str()),
        HistoryId::Postgres(id) => Err(StoreError::InvalidId(format!(
            "document backend cannot store history id {id}"
        ))),
    }
}

fn conflict(project_id: &str, detail: impl Into<String>) -> StoreError {
    StoreError::ChunkVersionConflict {
        project_id: project_id.to_string(),
        detail: detail.into(),
    }
}

fn read_file(path: &Path) -> Result<Collections> {
    let mut file = File::open(path)?;

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != DOC_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid metadata file magic".into()));
    }

    let mut version = [0u8; 1];
    file.read_exact(&mut version)?;
    if version[0] != DOC_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported metadata file version: {}",
            version[0]
        )));
    }

    let mut len_bytes = [0u8; 4];
    file.read_exact(&mut len_bytes)?;
    let mut body = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
    file.read_exact(&mut body)?;

    let mut checksum = [0u8; 4];
    file.read_exact(&mut checksum)?;
    if u32::from_le_bytes(checksum) != crc32fast::hash(&body) {
        return Err(StoreError::Corruption("metadata file checksum mismatch".into()));
    }

    Ok(rmp_serde::from_slice(&body)?)
}

fn write_file(path: &Path, collections: &Collections) -> Result<()> {
    let body = rmp_serde::to_vec(collections)?;
    let len = u32::try_from(body.len())
        .map_err(|_| StoreError::Serialization("metadata file too large".into()))?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(DOC_MAGIC)?;
    tmp.write_all(&[DOC_VERSION])?;
    tmp.write_all(&len.to_le_bytes())?;
    tmp.write_all(&body)?;
    tmp.write_all(&crc32fast::hash(&body).to_le_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

impl MetadataBackend for DocumentBackend {
    fn get_latest_chunk(&self, project_id: &HistoryId) -> Result<Option<ChunkRecord>> {
        let project = mongo_id(project_id)?;
        Ok(self.read(|c| c.latest(project).map(ChunkDoc::record)))
    }

    fn get_chunk_for_version(&self, project_id: &HistoryId, version: u64) -> Result<Option<ChunkRecord>> {
        let project = mongo_id(project_id)?;
        Ok(self.read(|c| {
            c.active(project)
                .filter(|doc| doc.end_version >= version)
                .min_by_key(|doc| doc.end_version)
                .map(ChunkDoc::record)
        }))
    }

    fn get_chunk_for_timestamp(
        &self,
        project_id: &HistoryId,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<ChunkRecord>> {
        let project = mongo_id(project_id)?;
        Ok(self.read(|c| {
            c.active(project)
                .filter(|doc| doc.end_timestamp.is_some_and(|ts| ts >= timestamp))
                .min_by_key(|doc| doc.end_version)
                .or_else(|| c.latest(project))
                .map(ChunkDoc::record)
        }))
    }

    fn get_chunks_from_version(
        &self,
        project_id: &HistoryId,
        from_version: u64,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>> {
        let project = mongo_id(project_id)?;
        Ok(self.read(|c| {
            let mut docs: Vec<_> = c
                .active(project)
                .filter(|doc| doc.end_version >= from_version)
                .collect();
            docs.sort_by_key(|doc| doc.start_version);
            docs.into_iter().take(limit).map(ChunkDoc::record).collect()
        }))
    }

    fn get_all_chunk_ids(&self, project_id: &HistoryId) -> Result<Vec<ChunkId>> {
        let project = mongo_id(project_id)?;
        Ok(self.read(|c| {
            c.chunks
                .values()
                .filter(|doc| doc.project_id == project)
                .map(|doc| ChunkId(doc.id.clone()))
                .collect()
        }))
    }

    fn insert_pending_chunk(&self, project_id: &HistoryId, start_version: u64, end_version: u64) -> Result<ChunkId> {
        let project = mongo_id(project_id)?.to_string();
        let id = self.next_id();
        self.mutate(|c| {
            c.chunks.insert(
                id.clone(),
                ChunkDoc {
                    id: id.clone(),
                    project_id: project,
                    start_version,
                    end_version,
                    end_timestamp: None,
                    state: ChunkState::Pending,
                },
            );
            Ok(ChunkId(id))
        })
    }

    fn confirm_create(
        &self,
        project_id: &HistoryId,
        chunk_id: &ChunkId,
        end_timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let project = mongo_id(project_id)?;
        self.mutate(|c| {
            let start = match c.chunks.get(&chunk_id.0) {
                Some(doc) if doc.state == ChunkState::Pending && doc.project_id == project => doc.start_version,
                _ => return Err(StoreError::NotFound(format!("pending chunk {chunk_id}"))),
            };
            if c.active(project).any(|doc| doc.start_version == start) {
                return Err(conflict(project, format!("a chunk already starts at version {start}")));
            }
            if let Some(latest) = c.latest(project) {
                if latest.end_version != start {
                    return Err(conflict(
                        project,
                        format!("new chunk starts at {start}, latest ends at {}", latest.end_version),
                    ));
                }
            }
            if let Some(doc) = c.chunks.get_mut(&chunk_id.0) {
                doc.state = ChunkState::Active;
                doc.end_timestamp = end_timestamp;
            }
            Ok(())
        })
    }

    fn confirm_update(
        &self,
        project_id: &HistoryId,
        expected_end_version: u64,
        old_chunk_id: &ChunkId,
        new_chunk_id: &ChunkId,
        end_timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let project = mongo_id(project_id)?;
        self.mutate(|c| {
            match c.latest(project) {
                Some(latest) if latest.id == old_chunk_id.0 && latest.end_version == expected_end_version => {}
                Some(latest) => {
                    return Err(conflict(
                        project,
                        format!(
                            "expected chunk {old_chunk_id} ending at {expected_end_version}, latest is {} ending at {}",
                            latest.id, latest.end_version
                        ),
                    ))
                }
                None => return Err(conflict(project, "no active chunk to update")),
            }
            match c.chunks.get(&new_chunk_id.0) {
                Some(doc) if doc.state == ChunkState::Pending && doc.project_id == project => {}
                _ => return Err(StoreError::NotFound(format!("pending chunk {new_chunk_id}"))),
            }
            if let Some(old) = c.chunks.get_mut(&old_chunk_id.0) {
                old.state = ChunkState::Closed;
            }
            if let Some(new) = c.chunks.get_mut(&new_chunk_id.0) {
                new.state = ChunkState::Active;
                new.end_timestamp = end_timestamp;
            }
            Ok(())
        })
    }

    fn delete_pending_chunk(&self, project_id: &HistoryId, chunk_id: &ChunkId) -> Result<()> {
        let project = mongo_id(project_id)?;
        self.mutate(|c| {
            let pending = c
                .chunks
                .get(&chunk_id.0)
                .is_some_and(|doc| doc.state == ChunkState::Pending && doc.project_id == project);
            if pending {
                c.chunks.remove(&chunk_id.0);
            }
            Ok(())
        })
    }

    fn delete_project_chunks(&self, project_id: &HistoryId) -> Result<()> {
        let project = mongo_id(project_id)?;
        self.mutate(|c| {
            c.chunks.retain(|_, doc| doc.project_id != project);
            Ok(())
        })
    }

    fn get_mongo_project_id(&self, project_id: &HistoryId) -> Result<Option<String>> {
        Ok(Some(mongo_id(project_id)?.to_string()))
    }

    fn set_mongo_project_id(&self, project_id: &HistoryId, mongo_id_value: &str) -> Result<()> {
        let project = mongo_id(project_id)?;
        if project != mongo_id_value {
            return Err(StoreError::InvalidId(format!(
                "history {project} is its own project id, not {mongo_id_value}"
            )));
        }
        Ok(())
    }

    fn insert_blob(&self, project_id: &HistoryId, blob: &Blob) -> Result<()> {
        let project = mongo_id(project_id)?.to_string();
        self.mutate(|c| {
            c.blobs
                .entry(project)
                .or_default()
                .entry(blob.hash.to_hex())
                .or_insert_with(|| blob.clone());
            Ok(())
        })
    }

    fn find_blob(&self, project_id: &HistoryId, hash: &BlobHash) -> Result<Option<Blob>> {
        let project = mongo_id(project_id)?;
        Ok(self.read(|c| c.blobs.get(project).and_then(|b| b.get(&hash.to_hex())).cloned()))
    }

    fn find_blobs(&self, project_id: &HistoryId, hashes: &[BlobHash]) -> Result<Vec<Blob>> {
        let project = mongo_id(project_id)?;
        Ok(self.read(|c| match c.blobs.get(project) {
            Some(blobs) => hashes
                .iter()
                .filter_map(|h| blobs.get(&h.to_hex()).cloned())
                .collect(),
            None => Vec::new(),
        }))
    }

    fn delete_blobs(&self, project_id: &HistoryId) -> Result<()> {
        let project = mongo_id(project_id)?;
        self.mutate(|c| {
            c.blobs.remove(project);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project() -> HistoryId {
        HistoryId::parse("5fa1b2c3d4e5f60718293a4b").unwrap()
    }

    #[test]
    fn test_generated_ids_look_like_object_ids() {
        let backend = DocumentBackend::in_memory();
        let a = backend.insert_pending_chunk(&project(), 0, 1).unwrap();
        let b = backend.insert_pending_chunk(&project(), 0, 1).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.0.len(), 24);
        assert!(HistoryId::parse(&a.0).unwrap().is_mongo());
    }

    #[test]
    fn test_confirm_update_fences_on_end_version() {
        let backend = DocumentBackend::in_memory();
        let project = project();
        let first = backend.insert_pending_chunk(&project, 0, 2).unwrap();
        backend.confirm_create(&project, &first, None).unwrap();

        let next = backend.insert_pending_chunk(&project, 0, 4).unwrap();
        assert!(backend
            .confirm_update(&project, 1, &first, &next, None)
            .unwrap_err()
            .is_conflict());
        backend.confirm_update(&project, 2, &first, &next, None).unwrap();
        assert_eq!(backend.get_latest_chunk(&project).unwrap().unwrap().id, next);
        assert_eq!(backend.get_all_chunk_ids(&project).unwrap().len(), 2);
    }

    #[test]
    fn test_latest_ignores_other_projects_and_pending() {
        let backend = DocumentBackend::in_memory();
        let project = project();
        let other = HistoryId::parse("5fa1b2c3d4e5f60718293a4c").unwrap();
        let early = Utc::now() - chrono::Duration::hours(2);

        let first = backend.insert_pending_chunk(&project, 0, 2).unwrap();
        backend.confirm_create(&project, &first, Some(early)).unwrap();
        let second = backend.insert_pending_chunk(&project, 2, 5).unwrap();
        backend.confirm_create(&project, &second, Some(early)).unwrap();
        backend.insert_pending_chunk(&project, 5, 9).unwrap();
        let foreign = backend.insert_pending_chunk(&other, 0, 7).unwrap();
        backend.confirm_create(&other, &foreign, None).unwrap();

        let latest = backend.get_latest_chunk(&project).unwrap().unwrap();
        assert_eq!((latest.id, latest.end_version), (second.clone(), 5));
        // a timestamp past every chunk falls back to the latest one
        let found = backend.get_chunk_for_timestamp(&project, Utc::now()).unwrap().unwrap();
        assert_eq!(found.id, second);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata.db");
        let blob = Blob {
            hash: BlobHash::of_content(b"abc"),
            byte_length: 3,
            string_length: Some(3),
        };
        {
            let backend = DocumentBackend::open(&path).unwrap();
            let id = backend.insert_pending_chunk(&project(), 0, 3).unwrap();
            backend.confirm_create(&project(), &id, Some(Utc::now())).unwrap();
            backend.insert_blob(&project(), &blob).unwrap();
        }
        let backend = DocumentBackend::open(&path).unwrap();
        assert_eq!(backend.get_latest_chunk(&project()).unwrap().unwrap().end_version, 3);
        assert_eq!(backend.find_blob(&project(), &blob.hash).unwrap(), Some(blob));
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata.db");
        let _first = DocumentBackend::open(&path).unwrap();
        assert!(matches!(DocumentBackend::open(&path), Err(StoreError::Locked)));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata.db");
        {
            let backend = DocumentBackend::open(&path).unwrap();
            backend.insert_pending_chunk(&project(), 0, 1).unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(DocumentBackend::open(&path), Err(StoreError::Corruption(_))));
    }
}
