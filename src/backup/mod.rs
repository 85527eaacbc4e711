//! Encrypted off-site backups of project histories.
//!
//! [`BackupService::backup_project`] walks a project's chunks forward from
//! the last backed-up version and copies each chunk payload and every blob
//! it introduces into the backup buckets. Content is encrypted per project
//! (see [`keys`]). The same service verifies, compares, archives and
//! finally deletes those backups.

mod archive;
mod delete;
mod generator;
pub mod keys;
mod persistor;
mod runner;
mod status;
mod verify;

pub use archive::ArchiveSummary;
pub use generator::{BackupGenerator, BackupItem};
pub use keys::{DataKey, KeyRing, RootKey};
pub use persistor::{BackupBuckets, BackupPersistor, ProjectPersistor};
pub use runner::{BackupComparison, BackupReport};
pub use status::{BackupStatus, BackupStatusStore, MemoryBackupStatusStore, SoftDeletion};

use crate::blobs::BlobService;
use crate::chunks::ChunkStore;
use crate::config::BackupSettings;
use std::sync::Arc;
use std::time::Duration;

/// Backup operations over one set of stores.
#[derive(Clone)]
pub struct BackupService {
    chunks: Arc<ChunkStore>,
    blobs: BlobService,
    persistor: BackupPersistor,
    status: Arc<dyn BackupStatusStore>,
    settings: BackupSettings,
    archive_timeout: Duration,
}

impl BackupService {
    pub fn new(
        chunks: Arc<ChunkStore>,
        blobs: BlobService,
        persistor: BackupPersistor,
        status: Arc<dyn BackupStatusStore>,
        settings: BackupSettings,
    ) -> Self {
        Self {
            chunks,
            blobs,
            persistor,
            status,
            settings,
            archive_timeout: Duration::from_secs(600),
        }
    }

    /// Wall-clock limit for building an archive.
    pub fn with_archive_timeout(mut self, timeout: Duration) -> Self {
        self.archive_timeout = timeout;
        self
    }

    pub fn persistor(&self) -> &BackupPersistor {
        &self.persistor
    }

    pub fn status(&self) -> &Arc<dyn BackupStatusStore> {
        &self.status
    }
}
