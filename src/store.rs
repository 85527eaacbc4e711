//! Main Store struct tying all components together.

use crate::backup::{
    ArchiveSummary, BackupBuckets, BackupComparison, BackupPersistor, BackupReport, BackupService,
    BackupStatusStore, KeyRing, MemoryBackupStatusStore,
};
use crate::blobs::{BlobService, BlobStore, GlobalBlobs};
use crate::buffer::{KvStore, QueueOptions, QueueStatus, WriteBuffer};
use crate::chunks::{ChunkStore, DocumentBackend, MetadataBackend, MetadataRouter, RelationalBackend};
use crate::config::Settings;
use crate::error::{Result, StoreError};
use crate::health;
use crate::history_store::HistoryStore;
use crate::model::{Change, Chunk};
use crate::persist::{
    BufferWorker, CommitOptions, CommitResult, HttpResyncClient, NoResync, PersistResult, Persister,
    ResyncRequester, WorkerReport,
};
use crate::storage::{LocalObjectStore, MemoryObjectStore, ObjectStore};
use crate::types::{BlobHash, HistoryId};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// External services a [`Store`] runs against.
pub struct Backends {
    pub objects: Arc<dyn ObjectStore>,
    pub relational: Arc<dyn MetadataBackend>,
    pub document: Arc<dyn MetadataBackend>,
    pub globals: GlobalBlobs,
    pub backup_status: Arc<dyn BackupStatusStore>,
    pub resync: Arc<dyn ResyncRequester>,
}

/// The project history store.
///
/// Provides a unified interface for:
/// - Queueing, persisting and committing changes
/// - Draining the write buffer in the background
/// - Backing up, verifying, archiving and deleting backups
pub struct Store {
    settings: Settings,
    chunks: Arc<ChunkStore>,
    blobs: BlobService,
    buffer: Arc<WriteBuffer>,
    persister: Arc<Persister>,
    backup: BackupService,

    /// Lock file for exclusive access to a local store directory.
    _lock_file: Option<File>,
}

impl Store {
    /// Wire up a store over the given backends.
    pub fn new(settings: Settings, backends: Backends) -> Result<Self> {
        settings.validate()?;
        let buckets = &settings.buckets;
        let metadata = Arc::new(MetadataRouter::new(backends.relational, backends.document));
        let buffer = Arc::new(WriteBuffer::new(
            Arc::new(KvStore::new(settings.buffer.shards)),
            settings.buffer.clone(),
        ));
        let chunks = Arc::new(
            ChunkStore::new(
                Arc::clone(&metadata),
                HistoryStore::new(Arc::clone(&backends.objects), buckets.chunks.clone()),
            )
            .with_buffer(Arc::clone(&buffer)),
        );
        let blobs = BlobService::new(
            Arc::clone(&backends.objects),
            metadata,
            Arc::new(backends.globals),
            buckets.blobs.clone(),
            buckets.global_blobs.clone(),
            settings.blob_cache_size,
        );
        let persister = Arc::new(
            Persister::new(
                Arc::clone(&chunks),
                blobs.clone(),
                Arc::clone(&buffer),
                backends.resync,
            )
            .with_policy(settings.content_hash_policy),
        );

        let backup_buckets = BackupBuckets {
            chunks: buckets.backup_chunks.clone(),
            blobs: buckets.backup_blobs.clone(),
            keys: buckets.backup_keys.clone(),
        };
        let persistor = if settings.backup.root_keys.is_empty() {
            info!("no backup root keys configured, backups are deletion-only");
            BackupPersistor::deletion_only(backends.objects, backup_buckets)
        } else {
            let key_ring = KeyRing::from_hex(&settings.backup.root_keys)?;
            BackupPersistor::new(backends.objects, backup_buckets, key_ring)
        };
        let backup = BackupService::new(
            Arc::clone(&chunks),
            blobs.clone(),
            persistor,
            backends.backup_status,
            settings.backup.clone(),
        )
        .with_archive_timeout(Duration::from_secs(settings.archive.timeout_secs));

        Ok(Self {
            settings,
            chunks,
            blobs,
            buffer,
            persister,
            backup,
            _lock_file: None,
        })
    }

    /// A store whose state lives only in memory.
    pub fn in_memory(settings: Settings) -> Result<Self> {
        let resync = resync_requester(&settings);
        Self::new(
            settings,
            Backends {
                objects: Arc::new(MemoryObjectStore::new()),
                relational: Arc::new(RelationalBackend::open_in_memory()?),
                document: Arc::new(DocumentBackend::in_memory()),
                globals: GlobalBlobs::default(),
                backup_status: Arc::new(MemoryBackupStatusStore::new()),
                resync,
            },
        )
    }

    /// A store persisted under `root`. Fails with [`StoreError::Locked`]
    /// while another process has the directory open.
    pub fn open_local(root: impl AsRef<Path>, settings: Settings) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let lock_file = Self::acquire_lock(root)?;
        let resync = resync_requester(&settings);
        let mut store = Self::new(
            settings,
            Backends {
                objects: Arc::new(LocalObjectStore::new(root.join("objects"))?),
                relational: Arc::new(RelationalBackend::open(root.join("chunks.sqlite"))?),
                document: Arc::new(DocumentBackend::open(root.join("documents.json"))?),
                globals: GlobalBlobs::default(),
                backup_status: Arc::new(MemoryBackupStatusStore::new()),
                resync,
            },
        )?;
        store._lock_file = Some(lock_file);
        info!(root = %root.display(), "opened local history store");
        Ok(store)
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;
        Ok(lock_file)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn chunks(&self) -> &Arc<ChunkStore> {
        &self.chunks
    }

    pub fn blobs(&self, project_id: &HistoryId) -> BlobStore {
        self.blobs.for_project(project_id)
    }

    pub fn buffer(&self) -> &Arc<WriteBuffer> {
        &self.buffer
    }

    pub fn persister(&self) -> &Arc<Persister> {
        &self.persister
    }

    pub fn backup(&self) -> &BackupService {
        &self.backup
    }

    // --- History ---

    pub fn initialize_project(&self, project_id: &HistoryId) -> Result<()> {
        self.chunks.initialize_project(project_id)
    }

    /// Latest chunk including changes still waiting in the buffer.
    pub fn load_latest(&self, project_id: &HistoryId) -> Result<Chunk> {
        self.chunks.load_latest(project_id, false)
    }

    pub fn queue_changes(
        &self,
        project_id: &HistoryId,
        changes: &[Change],
        end_version: u64,
        opts: QueueOptions,
    ) -> Result<QueueStatus> {
        self.persister.queue_changes(project_id, changes, end_version, opts)
    }

    /// Persist changes directly with the configured limits.
    pub fn persist_changes(
        &self,
        project_id: &HistoryId,
        changes: Vec<Change>,
        end_version: u64,
    ) -> Result<Option<PersistResult>> {
        let limits = self.settings.limits.limits_at(Utc::now());
        let result = self
            .persister
            .persist_changes(project_id, changes, &limits, end_version)?;
        if result.is_some() {
            self.mark_backup_pending(project_id)?;
        }
        Ok(result)
    }

    pub fn commit_changes(
        &self,
        project_id: &HistoryId,
        changes: Vec<Change>,
        end_version: u64,
        opts: CommitOptions,
    ) -> Result<CommitResult> {
        let limits = self.settings.limits.limits_at(Utc::now());
        let result = self
            .persister
            .commit_changes(project_id, changes, &limits, end_version, opts)?;
        if result.persist_result.is_some() || opts.force_persist_buffer {
            self.mark_backup_pending(project_id)?;
        }
        Ok(result)
    }

    pub fn persist_buffer(&self, project_id: &HistoryId) -> Result<PersistResult> {
        let limits = self.settings.limits.limits_at(Utc::now());
        let result = self.persister.persist_buffer(project_id, &limits)?;
        if result.number_of_changes_persisted > 0 {
            self.mark_backup_pending(project_id)?;
        }
        Ok(result)
    }

    /// One pass of the background buffer worker.
    pub fn run_buffer_worker(&self) -> Result<WorkerReport> {
        let worker = BufferWorker::new(Arc::clone(&self.persister), self.settings.limits.clone());
        let report = worker.run_once()?;
        for project_id in &report.flushed {
            self.mark_backup_pending(project_id)?;
        }
        Ok(report)
    }

    /// Remove a project's buffer, chunks and blobs. Its backup is left for
    /// [`Store::delete_project_backup`].
    pub fn delete_project_history(&self, project_id: &HistoryId) -> Result<()> {
        self.buffer.hard_delete_project(project_id)?;
        self.chunks.delete_project_chunks(project_id)?;
        self.blobs.for_project(project_id).delete_blobs()?;
        info!(%project_id, "deleted project history");
        Ok(())
    }

    fn mark_backup_pending(&self, project_id: &HistoryId) -> Result<()> {
        self.backup.status().mark_pending_change(project_id, Utc::now())
    }

    // --- Backups ---

    pub fn backup_project(&self, project_id: &HistoryId) -> Result<BackupReport> {
        self.backup.backup_project(project_id)
    }

    pub fn backup_pending_projects(&self, before: DateTime<Utc>) -> Result<Vec<(HistoryId, StoreError)>> {
        self.backup.backup_pending_projects(before)
    }

    pub fn compare_backups(&self, project_id: &HistoryId) -> Result<BackupComparison> {
        self.backup.compare_backups(project_id)
    }

    pub fn verify_blobs(&self, project_id: &HistoryId, hashes: &[BlobHash]) -> Result<()> {
        self.backup.verify_blobs(project_id, hashes)
    }

    pub fn verify_project(&self, project_id: &HistoryId) -> Result<usize> {
        self.backup.verify_project(project_id)
    }

    pub fn record_soft_deletion(
        &self,
        project_id: &str,
        history_id: Option<HistoryId>,
        deleted_at: DateTime<Utc>,
    ) -> Result<()> {
        self.backup.record_soft_deletion(project_id, history_id, deleted_at)
    }

    pub fn delete_project_backup(&self, project_id: &str) -> Result<()> {
        self.backup.delete_project_backup(project_id)
    }

    pub fn archive_latest(&self, project_id: &HistoryId, dest: &Path) -> Result<ArchiveSummary> {
        self.backup.archive_latest(project_id, dest)
    }

    pub fn archive_raw(&self, project_id: &HistoryId, dest: &Path) -> Result<ArchiveSummary> {
        self.backup.archive_raw(project_id, dest)
    }

    // --- Health ---

    pub fn health_check(&self) -> Result<()> {
        health::check(&self.chunks, &self.blobs, &self.settings.health_check)
    }
}

fn resync_requester(settings: &Settings) -> Arc<dyn ResyncRequester> {
    match &settings.resync_url {
        Some(url) => Arc::new(HttpResyncClient::new(url)),
        None => Arc::new(NoResync),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{File, Operation};
    use tempfile::TempDir;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.backup.root_keys = vec!["11".repeat(32)];
        settings.backup.retry_delay_ms = 0;
        settings
    }

    fn add(name: &str, content: &str) -> Change {
        Change::new(vec![Operation::add_file(name, File::from_string(content))], Utc::now())
    }

    #[test]
    fn test_persist_marks_backup_pending() {
        let store = Store::in_memory(settings()).unwrap();
        let project_id = HistoryId::Postgres(91);
        store.initialize_project(&project_id).unwrap();
        store
            .persist_changes(&project_id, vec![add("main.tex", "hello")], 0)
            .unwrap()
            .unwrap();

        let status = store.backup().status().get_status(&project_id).unwrap();
        assert!(status.pending_change_at.is_some());

        assert!(store.backup_pending_projects(Utc::now()).unwrap().is_empty());
        let status = store.backup().status().get_status(&project_id).unwrap();
        assert_eq!(status.last_backed_up_version, Some(1));
        assert_eq!(status.pending_change_at, None);
        assert_eq!(store.verify_project(&project_id).unwrap(), 1);
    }

    #[test]
    fn test_without_root_keys_backups_are_deletion_only() {
        let store = Store::in_memory(Settings::default()).unwrap();
        assert!(store.backup().persistor().is_deletion_only());
        let project_id = HistoryId::Postgres(92);
        store.initialize_project(&project_id).unwrap();
        assert!(matches!(store.backup_project(&project_id), Err(StoreError::DeletionOnly)));
    }

    #[test]
    fn test_delete_history_then_backup() {
        let store = Store::in_memory(settings()).unwrap();
        let project_id = HistoryId::Postgres(93);
        store.initialize_project(&project_id).unwrap();
        store
            .persist_changes(&project_id, vec![add("main.tex", "hello")], 0)
            .unwrap();
        store.backup_project(&project_id).unwrap();
        store
            .record_soft_deletion("5f0c9e8b7a6d5c4b3a291807", Some(project_id.clone()), Utc::now() - chrono::Duration::days(100))
            .unwrap();
        assert!(matches!(
            store.delete_project_backup("5f0c9e8b7a6d5c4b3a291807"),
            Err(StoreError::NotReadyToDelete { .. })
        ));

        store.delete_project_history(&project_id).unwrap();
        store.delete_project_backup("5f0c9e8b7a6d5c4b3a291807").unwrap();
        assert!(store.chunks().get_latest_chunk_metadata(&project_id).unwrap().is_none());
    }

    #[test]
    fn test_store_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store");
        let _store1 = Store::open_local(&path, settings()).unwrap();

        // Second store should fail to acquire lock
        let result = Store::open_local(&path, settings());
        assert!(matches!(result, Err(StoreError::Locked)));
    }
}
