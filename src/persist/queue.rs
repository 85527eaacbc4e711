//! Validating and staging changes in the write buffer.

use super::Persister;
use crate::blobs::BatchBlobStore;
use crate::buffer::{QueueOptions, QueueStatus};
use crate::error::{Result, StoreError};
use crate::model::{Change, LoadMode};
use crate::types::HistoryId;
use std::collections::BTreeSet;
use tracing::debug;

impl Persister {
    /// Queue `changes` on top of version `end_version`.
    ///
    /// The changes are replayed in strict mode against a hollow copy of the
    /// head snapshot, taken from the buffer or rebuilt from the latest
    /// persisted chunk. Nothing is queued if any operation is invalid.
    pub fn queue_changes(
        &self,
        project_id: &HistoryId,
        changes: &[Change],
        end_version: u64,
        opts: QueueOptions,
    ) -> Result<QueueStatus> {
        let (mut snapshot, head_version) = match self.buffer.get_head_snapshot(project_id)? {
            Some(head) => (head.snapshot, head.version),
            None => {
                let chunk = self.chunks.load_latest(project_id, true)?;
                (chunk.end_snapshot(false)?, chunk.end_version())
            }
        };
        if head_version != end_version {
            return Err(StoreError::ConflictingEndVersion {
                client_end_version: end_version,
                latest_end_version: head_version,
            });
        }

        let blobs = self.blobs.for_project(project_id);
        let batch = BatchBlobStore::new(&blobs);
        let mut hollow_changes = changes.to_vec();
        let mut hashes = BTreeSet::new();
        snapshot.find_blob_hashes(&mut hashes);
        for change in &hollow_changes {
            change.find_blob_hashes(&mut hashes);
        }
        batch.preload(hashes)?;

        snapshot.load_files(LoadMode::Hollow, &batch)?;
        for change in &mut hollow_changes {
            change.load_files(LoadMode::Hollow, &batch)?;
        }
        snapshot.apply_all(&hollow_changes, true)?;

        let status = self
            .buffer
            .queue_changes(project_id, &snapshot, end_version, changes, opts)?;
        debug!(%project_id, end_version, count = changes.len(), ?status, "queued changes");
        Ok(status)
    }
}
