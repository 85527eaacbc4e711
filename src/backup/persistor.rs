//! Encrypted access to the backup buckets.

use super::keys::{DataKey, KeyRing};
use crate::error::{Result, StoreError};
use crate::storage::keys::{
    checked_project_prefix, chunk_backup_key, dek_key, project_blob_key, project_folder, project_prefix,
};
use crate::storage::ObjectStore;
use crate::types::{BlobHash, HistoryId};
use std::sync::Arc;
use tracing::{debug, info};

/// Bucket names used for backups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupBuckets {
    pub chunks: String,
    pub blobs: String,
    pub keys: String,
}

/// Entry point to the backup buckets.
///
/// A persistor built with [`BackupPersistor::deletion_only`] holds no key
/// material. It can remove a project's backup but can never read one.
#[derive(Clone)]
pub struct BackupPersistor {
    objects: Arc<dyn ObjectStore>,
    buckets: BackupBuckets,
    key_ring: Option<Arc<KeyRing>>,
}

impl BackupPersistor {
    pub fn new(objects: Arc<dyn ObjectStore>, buckets: BackupBuckets, key_ring: KeyRing) -> Self {
        Self {
            objects,
            buckets,
            key_ring: Some(Arc::new(key_ring)),
        }
    }

    pub fn deletion_only(objects: Arc<dyn ObjectStore>, buckets: BackupBuckets) -> Self {
        Self {
            objects,
            buckets,
            key_ring: None,
        }
    }

    pub fn is_deletion_only(&self) -> bool {
        self.key_ring.is_none()
    }

    pub fn buckets(&self) -> &BackupBuckets {
        &self.buckets
    }

    fn key_ring(&self) -> Result<&KeyRing> {
        self.key_ring.as_deref().ok_or(StoreError::DeletionOnly)
    }

    /// Persistor for writing a project's backup. Creates the project's data
    /// key on first use.
    pub fn for_project(&self, project_id: &HistoryId) -> Result<ProjectPersistor> {
        let key_ring = self.key_ring()?;
        let folder = project_folder(project_id);
        let key_path = dek_key(project_id);
        let data_key = match self.objects.get(&self.buckets.keys, &key_path) {
            Ok(wrapped) => key_ring.unwrap(&wrapped, &folder)?,
            Err(e) if e.is_not_found() => {
                let data_key = DataKey::generate();
                self.objects
                    .put(&self.buckets.keys, &key_path, &key_ring.wrap(&data_key, &folder)?)?;
                info!(%project_id, root_key = key_ring.root_for(&folder).id(), "created backup data key");
                data_key
            }
            Err(e) => return Err(StoreError::load(format!("data key of project {project_id}"), e)),
        };
        Ok(self.project(project_id, data_key))
    }

    /// Persistor for reading an existing backup. Fails with `NotFound` when
    /// the project was never backed up.
    pub fn for_project_read_only(&self, project_id: &HistoryId) -> Result<ProjectPersistor> {
        let key_ring = self.key_ring()?;
        let wrapped = self.objects.get(&self.buckets.keys, &dek_key(project_id))?;
        let data_key = key_ring.unwrap(&wrapped, &project_folder(project_id))?;
        Ok(self.project(project_id, data_key))
    }

    fn project(&self, project_id: &HistoryId, data_key: DataKey) -> ProjectPersistor {
        ProjectPersistor {
            objects: Arc::clone(&self.objects),
            buckets: self.buckets.clone(),
            project_id: project_id.clone(),
            data_key,
        }
    }

    /// Remove every chunk, blob and key of a project's backup.
    pub fn delete_project(&self, project_id: &HistoryId) -> Result<()> {
        let prefix = checked_project_prefix(project_id)?;
        self.objects.delete_directory(&self.buckets.chunks, &prefix)?;
        self.objects.delete_directory(&self.buckets.blobs, &prefix)?;
        self.objects.delete(&self.buckets.keys, &dek_key(project_id))?;
        info!(%project_id, "deleted project backup");
        Ok(())
    }

    /// Start versions of every chunk in a project's backup.
    pub fn list_chunk_versions(&self, project_id: &HistoryId) -> Result<Vec<u64>> {
        let prefix = project_prefix(project_id);
        self.objects
            .list(&self.buckets.chunks, &prefix)?
            .into_iter()
            .map(|object| {
                object.key[prefix.len()..]
                    .parse()
                    .map_err(|_| StoreError::InvalidFormat(format!("not a chunk backup key: {}", object.key)))
            })
            .collect()
    }
}

/// Encrypting reader and writer for one project's backup.
pub struct ProjectPersistor {
    objects: Arc<dyn ObjectStore>,
    buckets: BackupBuckets,
    project_id: HistoryId,
    data_key: DataKey,
}

impl ProjectPersistor {
    pub fn project_id(&self) -> &HistoryId {
        &self.project_id
    }

    pub fn chunk_path(&self, start_version: u64) -> String {
        format!("{}/{}", self.buckets.chunks, chunk_backup_key(&self.project_id, start_version))
    }

    pub fn blob_path(&self, hash: &BlobHash) -> String {
        format!("{}/{}", self.buckets.blobs, project_blob_key(&self.project_id, hash))
    }

    // Ciphertexts are bound to their key so objects cannot be swapped.
    fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()> {
        let sealed = self.data_key.encrypt(data, key.as_bytes())?;
        self.objects.put(bucket, key, &sealed)
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let sealed = self.objects.get(bucket, key)?;
        self.data_key.decrypt(&sealed, key.as_bytes())
    }

    pub fn put_chunk(&self, start_version: u64, buffer: &[u8]) -> Result<()> {
        let key = chunk_backup_key(&self.project_id, start_version);
        self.put(&self.buckets.chunks, &key, buffer)?;
        debug!(project_id = %self.project_id, start_version, bytes = buffer.len(), "backed up chunk");
        Ok(())
    }

    pub fn get_chunk(&self, start_version: u64) -> Result<Vec<u8>> {
        self.get(&self.buckets.chunks, &chunk_backup_key(&self.project_id, start_version))
    }

    pub fn has_chunk(&self, start_version: u64) -> Result<bool> {
        self.objects
            .exists(&self.buckets.chunks, &chunk_backup_key(&self.project_id, start_version))
    }

    pub fn put_blob(&self, hash: &BlobHash, content: &[u8]) -> Result<()> {
        self.put(&self.buckets.blobs, &project_blob_key(&self.project_id, hash), content)
    }

    pub fn get_blob(&self, hash: &BlobHash) -> Result<Vec<u8>> {
        self.get(&self.buckets.blobs, &project_blob_key(&self.project_id, hash))
    }

    pub fn has_blob(&self, hash: &BlobHash) -> Result<bool> {
        self.objects
            .exists(&self.buckets.blobs, &project_blob_key(&self.project_id, hash))
    }
}
