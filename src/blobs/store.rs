//! Per-project blob store.

use crate::blobs::{Blob, BlobSource, GlobalBlobs};
use crate::chunks::MetadataRouter;
use crate::error::{Result, StoreError};
use crate::storage::keys::{checked_project_prefix, global_blob_key, project_blob_key};
use crate::storage::ObjectStore;
use crate::types::{BlobHash, HistoryId};
use lru::LruCache;
use parking_lot::Mutex;
use std::io::Read;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Shared state behind every project's [`BlobStore`].
#[derive(Clone)]
pub struct BlobService {
    objects: Arc<dyn ObjectStore>,
    metadata: Arc<MetadataRouter>,
    globals: Arc<GlobalBlobs>,
    project_bucket: String,
    global_bucket: String,
    /// LRU cache of recently read content, per project.
    cache: Arc<Mutex<LruCache<(HistoryId, BlobHash), Arc<Vec<u8>>>>>,
}

impl BlobService {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        metadata: Arc<MetadataRouter>,
        globals: Arc<GlobalBlobs>,
        project_bucket: impl Into<String>,
        global_bucket: impl Into<String>,
        cache_size: usize,
    ) -> Self {
        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            objects,
            metadata,
            globals,
            project_bucket: project_bucket.into(),
            global_bucket: global_bucket.into(),
            cache: Arc::new(Mutex::new(LruCache::new(cache_size))),
        }
    }

    pub fn for_project(&self, project_id: &HistoryId) -> BlobStore {
        BlobStore {
            service: self.clone(),
            project_id: project_id.clone(),
        }
    }

    pub fn globals(&self) -> &GlobalBlobs {
        &self.globals
    }
}

/// Blob store scoped to one project.
#[derive(Clone)]
pub struct BlobStore {
    service: BlobService,
    project_id: HistoryId,
}

impl BlobStore {
    pub fn project_id(&self) -> &HistoryId {
        &self.project_id
    }

    /// Metadata for one blob, or `None` if the project does not have it.
    pub fn get_blob(&self, hash: &BlobHash) -> Result<Option<Blob>> {
        if let Some(global) = self.service.globals.get(hash) {
            if !global.demoted {
                return Ok(Some(global.blob.clone()));
            }
        }
        self.service
            .metadata
            .for_project(&self.project_id)
            .find_blob(&self.project_id, hash)
    }

    /// Metadata for many blobs in one backend round trip. Unknown hashes are
    /// left out of the result.
    pub fn get_blobs(&self, hashes: &[BlobHash]) -> Result<Vec<Blob>> {
        let mut blobs = Vec::with_capacity(hashes.len());
        let mut lookup = Vec::new();
        for hash in hashes {
            match self.service.globals.get(hash) {
                Some(global) if !global.demoted => blobs.push(global.blob.clone()),
                _ => lookup.push(*hash),
            }
        }
        if !lookup.is_empty() {
            blobs.extend(
                self.service
                    .metadata
                    .for_project(&self.project_id)
                    .find_blobs(&self.project_id, &lookup)?,
            );
        }
        Ok(blobs)
    }

    fn location(&self, hash: &BlobHash) -> (&str, String) {
        if self.service.globals.is_active(hash) {
            (self.service.global_bucket.as_str(), global_blob_key(hash))
        } else {
            (
                self.service.project_bucket.as_str(),
                project_blob_key(&self.project_id, hash),
            )
        }
    }

    fn map_fetch_error(hash: &BlobHash, err: StoreError) -> StoreError {
        if err.is_not_found() {
            StoreError::BlobNotFound(hash.to_hex())
        } else {
            StoreError::load(format!("blob {hash}"), err)
        }
    }

    pub fn get_bytes(&self, hash: &BlobHash) -> Result<Arc<Vec<u8>>> {
        let cache_key = (self.project_id.clone(), *hash);
        if let Some(content) = self.service.cache.lock().get(&cache_key) {
            return Ok(Arc::clone(content));
        }
        let (bucket, key) = self.location(hash);
        let data = self
            .service
            .objects
            .get(bucket, &key)
            .map_err(|e| Self::map_fetch_error(hash, e))?;
        let data = Arc::new(data);
        self.service.cache.lock().put(cache_key, Arc::clone(&data));
        Ok(data)
    }

    /// Content as text. Invalid UTF-8 sequences are replaced.
    pub fn get_string(&self, hash: &BlobHash) -> Result<String> {
        let data = self.get_bytes(hash)?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    pub fn get_stream(&self, hash: &BlobHash) -> Result<Box<dyn Read + Send>> {
        let (bucket, key) = self.location(hash);
        self.service
            .objects
            .get_stream(bucket, &key)
            .map_err(|e| Self::map_fetch_error(hash, e))
    }

    pub fn put_string(&self, content: &str) -> Result<Blob> {
        self.put_bytes(content.as_bytes(), Some(content.chars().count()))
    }

    /// Store a file from disk. Valid UTF-8 without NUL bytes counts as text.
    pub fn put_file(&self, path: impl AsRef<Path>) -> Result<Blob> {
        let data = std::fs::read(path)?;
        let string_length = match std::str::from_utf8(&data) {
            Ok(text) if !text.contains('\0') => Some(text.chars().count()),
            _ => None,
        };
        self.put_bytes(&data, string_length)
    }

    /// Store content unless the project or the global table already has it.
    pub fn put_bytes(&self, data: &[u8], string_length: Option<usize>) -> Result<Blob> {
        let hash = BlobHash::of_content(data);
        if let Some(global) = self.service.globals.get(&hash) {
            if !global.demoted {
                return Ok(global.blob.clone());
            }
        }
        let backend = self.service.metadata.for_project(&self.project_id);
        if let Some(blob) = backend.find_blob(&self.project_id, &hash)? {
            return Ok(blob);
        }

        let key = project_blob_key(&self.project_id, &hash);
        self.service
            .objects
            .put(&self.service.project_bucket, &key, data)
            .map_err(|e| StoreError::store(format!("blob {hash}"), e))?;
        let blob = Blob {
            hash,
            byte_length: data.len() as u64,
            string_length,
        };
        backend.insert_blob(&self.project_id, &blob)?;
        self.service
            .cache
            .lock()
            .put((self.project_id.clone(), hash), Arc::new(data.to_vec()));
        debug!(project_id = %self.project_id, %hash, bytes = data.len(), "stored blob");
        Ok(blob)
    }

    /// Remove every blob of the project. Only used by full project deletion.
    pub fn delete_blobs(&self) -> Result<()> {
        self.service
            .objects
            .delete_directory(&self.service.project_bucket, &checked_project_prefix(&self.project_id)?)?;
        self.service
            .metadata
            .for_project(&self.project_id)
            .delete_blobs(&self.project_id)
    }
}

impl BlobSource for BlobStore {
    fn get_blob(&self, hash: &BlobHash) -> Result<Option<Blob>> {
        BlobStore::get_blob(self, hash)
    }

    fn get_string(&self, hash: &BlobHash) -> Result<String> {
        BlobStore::get_string(self, hash)
    }
}
