//! Per-project backup bookkeeping.

use crate::error::Result;
use crate::types::{BlobHash, HistoryId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupStatus {
    /// End version of the last chunk copied to the backup.
    pub last_backed_up_version: Option<u64>,
    pub last_backed_up_at: Option<DateTime<Utc>>,
    /// Oldest persisted change not yet backed up.
    pub pending_change_at: Option<DateTime<Utc>>,
}

/// A project deleted by its owner, kept until the grace period ends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SoftDeletion {
    pub project_id: String,
    pub history_id: Option<HistoryId>,
    pub deleted_at: DateTime<Utc>,
}

pub trait BackupStatusStore: Send + Sync {
    fn get_status(&self, project_id: &HistoryId) -> Result<BackupStatus>;

    /// Advance the watermark and clear the pending marker.
    fn set_backed_up_version(&self, project_id: &HistoryId, version: u64, at: DateTime<Utc>) -> Result<()>;

    /// Record a persisted change. Keeps the earliest pending time.
    fn mark_pending_change(&self, project_id: &HistoryId, at: DateTime<Utc>) -> Result<()>;

    fn clear_pending_change(&self, project_id: &HistoryId) -> Result<()>;

    /// Projects with a pending change older than `before`.
    fn pending_projects(&self, before: DateTime<Utc>) -> Result<Vec<HistoryId>>;

    fn backed_up_blobs(&self, project_id: &HistoryId) -> Result<BTreeSet<BlobHash>>;

    fn add_backed_up_blobs(&self, project_id: &HistoryId, hashes: &[BlobHash]) -> Result<()>;

    fn clear_backed_up_blobs(&self, project_id: &HistoryId) -> Result<()>;

    fn record_soft_deletion(&self, deletion: SoftDeletion) -> Result<()>;

    fn soft_deletion(&self, project_id: &str) -> Result<Option<SoftDeletion>>;

    /// Forget everything about a project whose backup was deleted.
    fn delete_project(&self, project_id: &HistoryId) -> Result<()>;
}

#[derive(Default)]
struct Tables {
    status: HashMap<HistoryId, BackupStatus>,
    blobs: HashMap<HistoryId, BTreeSet<BlobHash>>,
    deletions: HashMap<String, SoftDeletion>,
}

#[derive(Default)]
pub struct MemoryBackupStatusStore {
    tables: Mutex<Tables>,
}

impl MemoryBackupStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackupStatusStore for MemoryBackupStatusStore {
    fn get_status(&self, project_id: &HistoryId) -> Result<BackupStatus> {
        Ok(self.tables.lock().status.get(project_id).cloned().unwrap_or_default())
    }

    fn set_backed_up_version(&self, project_id: &HistoryId, version: u64, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.lock();
        let status = tables.status.entry(project_id.clone()).or_default();
        status.last_backed_up_version = Some(version);
        status.last_backed_up_at = Some(at);
        Ok(())
    }

    fn mark_pending_change(&self, project_id: &HistoryId, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.lock();
        let status = tables.status.entry(project_id.clone()).or_default();
        status.pending_change_at = Some(status.pending_change_at.map_or(at, |t| t.min(at)));
        Ok(())
    }

    fn clear_pending_change(&self, project_id: &HistoryId) -> Result<()> {
        if let Some(status) = self.tables.lock().status.get_mut(project_id) {
            status.pending_change_at = None;
        }
        Ok(())
    }

    fn pending_projects(&self, before: DateTime<Utc>) -> Result<Vec<HistoryId>> {
        let tables = self.tables.lock();
        let mut pending: Vec<_> = tables
            .status
            .iter()
            .filter_map(|(id, s)| s.pending_change_at.filter(|t| *t < before).map(|t| (t, id.clone())))
            .collect();
        pending.sort();
        Ok(pending.into_iter().map(|(_, id)| id).collect())
    }

    fn backed_up_blobs(&self, project_id: &HistoryId) -> Result<BTreeSet<BlobHash>> {
        Ok(self.tables.lock().blobs.get(project_id).cloned().unwrap_or_default())
    }

    fn add_backed_up_blobs(&self, project_id: &HistoryId, hashes: &[BlobHash]) -> Result<()> {
        self.tables
            .lock()
            .blobs
            .entry(project_id.clone())
            .or_default()
            .extend(hashes.iter().copied());
        Ok(())
    }

    fn clear_backed_up_blobs(&self, project_id: &HistoryId) -> Result<()> {
        self.tables.lock().blobs.remove(project_id);
        Ok(())
    }

    fn record_soft_deletion(&self, deletion: SoftDeletion) -> Result<()> {
        self.tables
            .lock()
            .deletions
            .insert(deletion.project_id.clone(), deletion);
        Ok(())
    }

    fn soft_deletion(&self, project_id: &str) -> Result<Option<SoftDeletion>> {
        Ok(self.tables.lock().deletions.get(project_id).cloned())
    }

    fn delete_project(&self, project_id: &HistoryId) -> Result<()> {
        let mut tables = self.tables.lock();
        tables.status.remove(project_id);
        tables.blobs.remove(project_id);
        Ok(())
    }
}
