//! Backup verification.
//!
//! A backup only counts once its content has been read back and re-hashed
//! independently of whatever process wrote it.

use super::BackupService;
use crate::blobs::hash::git_blob_hash_reader;
use crate::error::{Result, StoreError};
use crate::history_store;
use crate::types::{BlobHash, HistoryId};
use std::collections::BTreeSet;
use std::io::Cursor;
use tracing::{debug, error};

impl BackupService {
    /// Re-hash the backup copy of each blob against the project's blob
    /// metadata. Fails with [`StoreError::BackupCorrupted`] on the first
    /// blob whose copy is missing, unreadable or different.
    pub fn verify_blobs(&self, project_id: &HistoryId, hashes: &[BlobHash]) -> Result<()> {
        let persistor = self.persistor.for_project_read_only(project_id)?;
        let blobs = self.blobs.for_project(project_id);
        for hash in hashes {
            let blob = blobs
                .get_blob(hash)?
                .ok_or_else(|| StoreError::BlobNotFound(hash.to_hex()))?;
            let path = persistor.blob_path(hash);
            let corrupted = |reason: String| {
                error!(%project_id, %path, %reason, "backup blob failed verification");
                StoreError::BackupCorrupted {
                    path: path.clone(),
                    reason,
                }
            };
            let content = persistor
                .get_blob(hash)
                .map_err(|e| corrupted(format!("cannot read backup copy: {e}")))?;
            let actual = git_blob_hash_reader(Cursor::new(content), blob.byte_length)
                .map_err(|e| corrupted(e.to_string()))?;
            if actual != *hash {
                return Err(corrupted(format!("hash is {actual}")));
            }
        }
        debug!(%project_id, blobs = hashes.len(), "verified backup blobs");
        Ok(())
    }

    /// Check that the latest chunk is in the backup and that every blob it
    /// references verifies. Returns the number of blobs checked.
    pub fn verify_project(&self, project_id: &HistoryId) -> Result<usize> {
        let Some(latest) = self.chunks.get_latest_chunk_metadata(project_id)? else {
            return Ok(0);
        };
        let rpo_violation = |detail: String| StoreError::BackupRpoViolation {
            project_id: project_id.to_string(),
            detail,
        };
        let persistor = match self.persistor.for_project_read_only(project_id) {
            Ok(persistor) => persistor,
            Err(e) if e.is_not_found() => return Err(rpo_violation("project was never backed up".into())),
            Err(e) => return Err(e),
        };
        if !persistor.has_chunk(latest.start_version)? {
            return Err(rpo_violation(format!(
                "latest chunk {}..{} is not backed up",
                latest.start_version, latest.end_version
            )));
        }

        let path = persistor.chunk_path(latest.start_version);
        let history = persistor
            .get_chunk(latest.start_version)
            .and_then(|buffer| history_store::decode(&buffer))
            .map_err(|e| StoreError::BackupCorrupted {
                path,
                reason: e.to_string(),
            })?;
        let mut hashes = BTreeSet::new();
        history.find_blob_hashes(&mut hashes);
        let globals = self.blobs.globals();
        let hashes: Vec<_> = hashes.into_iter().filter(|h| !globals.is_active(h)).collect();
        self.verify_blobs(project_id, &hashes)?;
        Ok(hashes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{fixture, persist_files};
    use super::*;

    #[test]
    fn test_verify_passes_after_backup() {
        let f = fixture();
        let project_id = HistoryId::Postgres(51);
        persist_files(&f, &project_id, &[("a.tex", "alpha"), ("b.tex", "beta")], 10);
        f.service.backup_project(&project_id).unwrap();
        assert_eq!(f.service.verify_project(&project_id).unwrap(), 2);
    }

    #[test]
    fn test_same_length_alteration_is_detected() {
        let f = fixture();
        let project_id = HistoryId::Postgres(52);
        persist_files(&f, &project_id, &[("a.tex", "alpha")], 10);
        f.service.backup_project(&project_id).unwrap();

        let hash = BlobHash::of_content(b"alpha");
        let writer = f.service.persistor().for_project(&project_id).unwrap();
        writer.put_blob(&hash, b"alphb").unwrap();

        let err = f.service.verify_blobs(&project_id, &[hash]).unwrap_err();
        match err {
            StoreError::BackupCorrupted { path, .. } => assert_eq!(path, writer.blob_path(&hash)),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_missing_copy_is_corruption() {
        let f = fixture();
        let project_id = HistoryId::Postgres(53);
        persist_files(&f, &project_id, &[("a.tex", "alpha")], 10);
        f.service.backup_project(&project_id).unwrap();
        let hash = BlobHash::of_content(b"beta");
        f.persister.blobs().for_project(&project_id).put_string("beta").unwrap();

        assert!(matches!(
            f.service.verify_blobs(&project_id, &[hash]),
            Err(StoreError::BackupCorrupted { .. })
        ));
    }

    #[test]
    fn test_unbacked_latest_chunk_violates_rpo() {
        let f = fixture();
        let project_id = HistoryId::Postgres(54);
        persist_files(&f, &project_id, &[("a.tex", "alpha")], 10);
        assert!(matches!(
            f.service.verify_project(&project_id),
            Err(StoreError::BackupRpoViolation { .. })
        ));

        f.service.backup_project(&project_id).unwrap();
        persist_files(&f, &project_id, &[("b.tex", "beta")], 1);
        assert!(matches!(
            f.service.verify_project(&project_id),
            Err(StoreError::BackupRpoViolation { .. })
        ));
    }
}
