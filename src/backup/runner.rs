//! Backup passes and backup comparison.

use super::{BackupGenerator, BackupService, ProjectPersistor};
use crate::blobs::{Blob, BlobStore};
use crate::error::{Result, StoreError};
use crate::types::{BlobHash, HistoryId};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of one [`BackupService::backup_project`] pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupReport {
    pub chunks_backed_up: usize,
    pub blobs_backed_up: usize,
    pub last_backed_up_version: Option<u64>,
    /// False when a blob could not be copied. The watermark stays before
    /// the affected chunk and a later pass picks it up again.
    pub complete: bool,
}

/// Differences between the live history and its backup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupComparison {
    pub chunks_checked: usize,
    pub missing_chunks: Vec<u64>,
    pub mismatched_chunks: Vec<u64>,
    pub blobs_checked: usize,
    pub missing_blobs: Vec<BlobHash>,
}

impl BackupComparison {
    pub fn is_consistent(&self) -> bool {
        self.missing_chunks.is_empty() && self.mismatched_chunks.is_empty() && self.missing_blobs.is_empty()
    }
}

impl BackupService {
    /// Copy every chunk and blob persisted since the last pass.
    pub fn backup_project(&self, project_id: &HistoryId) -> Result<BackupReport> {
        let status = self.status.get_status(project_id)?;
        let mut report = BackupReport {
            last_backed_up_version: status.last_backed_up_version,
            complete: true,
            ..Default::default()
        };
        let Some(latest) = self.chunks.get_latest_chunk_metadata(project_id)? else {
            debug!(%project_id, "no chunks to back up");
            return Ok(report);
        };
        if status.last_backed_up_version.is_some_and(|v| v >= latest.end_version) {
            self.status.clear_pending_change(project_id)?;
            return Ok(report);
        }

        let persistor = self.persistor.for_project(project_id)?;
        let uploaded = self.status.backed_up_blobs(project_id)?;
        let blobs = self.blobs.for_project(project_id);
        let generator = BackupGenerator::new(&self.chunks, &blobs, self.blobs.globals(), status.last_backed_up_version);
        for item in generator {
            let item = item?;
            for blob in &item.blobs {
                if uploaded.contains(&blob.hash) || persistor.has_blob(&blob.hash)? {
                    continue;
                }
                if let Err(e) = self.upload_blob(&blobs, &persistor, blob) {
                    warn!(
                        %project_id,
                        hash = %blob.hash,
                        chunk_start = item.record.start_version,
                        error = %e,
                        "blob backup failed, leaving chunk for a later pass"
                    );
                    report.complete = false;
                    return Ok(report);
                }
                self.status.add_backed_up_blobs(project_id, &[blob.hash])?;
                report.blobs_backed_up += 1;
            }
            persistor.put_chunk(item.record.start_version, &item.buffer)?;
            self.status
                .set_backed_up_version(project_id, item.record.end_version, Utc::now())?;
            report.chunks_backed_up += 1;
            report.last_backed_up_version = Some(item.record.end_version);
        }

        self.status.clear_backed_up_blobs(project_id)?;
        let caught_up = self
            .chunks
            .get_latest_chunk_metadata(project_id)?
            .is_some_and(|latest| report.last_backed_up_version >= Some(latest.end_version));
        if caught_up {
            self.status.clear_pending_change(project_id)?;
        }
        info!(
            %project_id,
            chunks = report.chunks_backed_up,
            blobs = report.blobs_backed_up,
            version = ?report.last_backed_up_version,
            "backed up project"
        );
        Ok(report)
    }

    fn upload_blob(&self, blobs: &BlobStore, persistor: &ProjectPersistor, blob: &Blob) -> Result<()> {
        let attempts = self.settings.retries.max(1);
        let mut attempt = 1;
        loop {
            let result = blobs
                .get_bytes(&blob.hash)
                .and_then(|content| persistor.put_blob(&blob.hash, &content));
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts && !e.is_not_found() => {
                    debug!(hash = %blob.hash, attempt, error = %e, "retrying blob backup");
                    std::thread::sleep(Duration::from_millis(self.settings.retry_delay_ms));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Back up every project with a change persisted before `before`.
    /// Returns the projects whose pass failed.
    pub fn backup_pending_projects(&self, before: DateTime<Utc>) -> Result<Vec<(HistoryId, StoreError)>> {
        let mut failures = Vec::new();
        for project_id in self.status.pending_projects(before)? {
            match self.backup_project(&project_id) {
                Ok(report) if report.complete => {}
                Ok(_) => debug!(%project_id, "backup pass incomplete"),
                Err(e) => {
                    warn!(%project_id, error = %e, "backup pass failed");
                    failures.push((project_id, e));
                }
            }
        }
        Ok(failures)
    }

    /// Check every backed-up chunk and blob against the live history.
    pub fn compare_backups(&self, project_id: &HistoryId) -> Result<BackupComparison> {
        let mut comparison = BackupComparison::default();
        let Some(last) = self.status.get_status(project_id)?.last_backed_up_version else {
            return Ok(comparison);
        };
        let persistor = self.persistor.for_project_read_only(project_id)?;
        let blobs = self.blobs.for_project(project_id);
        let globals = self.blobs.globals();
        let mut hashes = BTreeSet::new();

        for record in self.chunks.get_project_chunks(project_id)? {
            if record.start_version > last || (record.start_version == last && record.end_version > last) {
                break;
            }
            comparison.chunks_checked += 1;
            let (chunk, buffer) = self.chunks.load_buffer_by_record(project_id, &record)?;
            if !persistor.has_chunk(record.start_version)? {
                comparison.missing_chunks.push(record.start_version);
                continue;
            }
            if record.end_version <= last {
                // only chunks unchanged since their backup can match
                if persistor.get_chunk(record.start_version)? != buffer {
                    comparison.mismatched_chunks.push(record.start_version);
                }
            }
            chunk.history().find_blob_hashes(&mut hashes);
        }

        for hash in hashes.iter().filter(|h| !globals.is_active(h)) {
            if blobs.get_blob(hash)?.is_none() {
                continue;
            }
            comparison.blobs_checked += 1;
            if !persistor.has_blob(hash)? {
                comparison.missing_blobs.push(*hash);
            }
        }
        if !comparison.is_consistent() {
            warn!(%project_id, ?comparison, "backup differs from live history");
        }
        Ok(comparison)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{fixture, persist_files, GLOBAL_CONTENT};
    use super::super::BackupStatusStore;
    use super::*;
    use crate::storage::keys::project_blob_key;
    use crate::storage::ObjectStore;

    #[test]
    fn test_backup_project_copies_chunks_and_blobs() {
        let f = fixture();
        let project_id = HistoryId::Postgres(41);
        persist_files(
            &f,
            &project_id,
            &[("a.tex", "alpha"), ("b.tex", "beta"), ("main.tex", GLOBAL_CONTENT)],
            2,
        );

        let report = f.service.backup_project(&project_id).unwrap();
        assert!(report.complete);
        assert_eq!(report.chunks_backed_up, 2);
        assert_eq!(report.blobs_backed_up, 2);
        assert_eq!(report.last_backed_up_version, Some(3));

        let reader = f.service.persistor().for_project_read_only(&project_id).unwrap();
        assert!(reader.has_chunk(0).unwrap());
        assert!(reader.has_chunk(2).unwrap());
        assert_eq!(reader.get_blob(&BlobHash::of_content(b"alpha")).unwrap(), b"alpha");
        assert!(!reader.has_blob(&BlobHash::of_content(GLOBAL_CONTENT.as_bytes())).unwrap());

        // nothing new: the second pass is a no-op
        let again = f.service.backup_project(&project_id).unwrap();
        assert_eq!(again.chunks_backed_up, 0);
        assert!(f.service.compare_backups(&project_id).unwrap().is_consistent());
    }

    #[test]
    fn test_failed_blob_keeps_watermark() {
        let f = fixture();
        let project_id = HistoryId::Postgres(42);
        persist_files(&f, &project_id, &[("a.tex", "alpha")], 10);
        f.service.backup_project(&project_id).unwrap();

        persist_files(&f, &project_id, &[("b.tex", "beta")], 1);
        f.objects
            .delete("blobs", &project_blob_key(&project_id, &BlobHash::of_content(b"beta")))
            .unwrap();
        // push the deleted blob out of the content cache
        f.persister
            .blobs()
            .for_project(&project_id)
            .get_bytes(&BlobHash::of_content(b"alpha"))
            .unwrap();
        let report = f.service.backup_project(&project_id).unwrap();
        assert!(!report.complete);
        assert_eq!(report.last_backed_up_version, Some(1));
        assert_eq!(
            f.status.get_status(&project_id).unwrap().last_backed_up_version,
            Some(1)
        );
    }

    #[test]
    fn test_pending_projects_are_backed_up() {
        let f = fixture();
        let project_id = HistoryId::Postgres(43);
        persist_files(&f, &project_id, &[("a.tex", "alpha")], 10);
        f.status
            .mark_pending_change(&project_id, Utc::now() - chrono::Duration::minutes(5))
            .unwrap();

        let failures = f.service.backup_pending_projects(Utc::now()).unwrap();
        assert!(failures.is_empty());
        let status = f.status.get_status(&project_id).unwrap();
        assert_eq!(status.last_backed_up_version, Some(1));
        assert_eq!(status.pending_change_at, None);
    }

    #[test]
    fn test_compare_reports_missing_blob() {
        let f = fixture();
        let project_id = HistoryId::Postgres(44);
        persist_files(&f, &project_id, &[("a.tex", "alpha")], 10);
        f.service.backup_project(&project_id).unwrap();
        f.objects
            .delete("backup-blobs", &project_blob_key(&project_id, &BlobHash::of_content(b"alpha")))
            .unwrap();

        let comparison = f.service.compare_backups(&project_id).unwrap();
        assert_eq!(comparison.chunks_checked, 1);
        assert_eq!(comparison.missing_blobs, vec![BlobHash::of_content(b"alpha")]);
    }
}
