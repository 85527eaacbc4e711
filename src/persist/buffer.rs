//! Draining the write buffer into the chunk store.

use super::{PersistLimits, PersistResult, Persister};
use crate::blobs::BatchBlobStore;
use crate::buffer::PersistedVersionStatus;
use crate::error::{Result, StoreError};
use crate::model::LoadMode;
use crate::types::HistoryId;
use std::collections::BTreeSet;
use tracing::{debug, info};

impl Persister {
    /// Persist buffered changes in batches until the buffer has nothing
    /// left that `limits` allow to flush.
    ///
    /// Always returns the latest persisted chunk, even when nothing was
    /// drained.
    pub fn persist_buffer(&self, project_id: &HistoryId, limits: &PersistLimits) -> Result<PersistResult> {
        let mut current_chunk = self.chunks.load_latest(project_id, true)?;
        let original_end_version = current_chunk.end_version();
        self.catch_up_persisted_version(project_id, original_end_version)?;

        let blobs = self.blobs.for_project(project_id);
        let mut end_version = original_end_version;
        let mut number_of_changes_persisted = 0;
        let mut resync_needed = false;

        loop {
            let mut changes =
                self.buffer
                    .get_non_persisted_changes(project_id, end_version, Some(self.drain_batch_size))?;
            if changes.is_empty() {
                break;
            }
            let batch_len = changes.len();
            let has_resync_change = changes.iter().any(|c| c.is_resync());

            let batch = BatchBlobStore::new(&blobs);
            let mut hashes = BTreeSet::new();
            for change in &changes {
                change.find_blob_hashes(&mut hashes);
            }
            batch.preload(hashes)?;
            for change in &mut changes {
                change.load_files(LoadMode::Eager, &batch)?;
            }

            let Some(result) = self.persist_changes(project_id, changes, limits, end_version)? else {
                break;
            };
            let new_end_version = result.current_chunk.end_version();
            if new_end_version <= end_version {
                return Err(StoreError::Invariant(format!(
                    "persisted version of project {project_id} did not advance past {end_version}"
                )));
            }
            let status = self.buffer.set_persisted_version(project_id, new_end_version)?;
            if status != PersistedVersionStatus::Ok {
                return Err(StoreError::Invariant(format!(
                    "buffer of project {project_id} refused persisted version {new_end_version}: {status:?}"
                )));
            }

            debug!(%project_id, from = end_version, to = new_end_version, "drained buffer batch");
            number_of_changes_persisted += result.number_of_changes_persisted;
            end_version = new_end_version;
            current_chunk = result.current_chunk;

            if result.resync_needed {
                resync_needed = true;
                if limits.auto_resync && !has_resync_change {
                    info!(%project_id, "content hash drift detected, requesting resync");
                    self.resync.request_resync(project_id)?;
                }
            }

            if result.number_of_changes_persisted < batch_len || batch_len < self.drain_batch_size {
                break;
            }
        }

        Ok(PersistResult {
            number_of_changes_persisted,
            original_end_version,
            current_chunk,
            resync_needed,
        })
    }

    /// A worker may have extended the chunk store and then failed to record
    /// it in the buffer. Move the buffer's marker forward to match.
    fn catch_up_persisted_version(&self, project_id: &HistoryId, end_version: u64) -> Result<()> {
        let state = self.buffer.get_state(project_id)?;
        let Some(head_version) = state.head_version else {
            return Ok(());
        };
        let behind = state.persisted_version.map_or(true, |v| v < end_version);
        if head_version >= end_version && behind {
            debug!(%project_id, end_version, "advancing lagging persisted version");
            self.buffer.set_persisted_version(project_id, end_version)?;
        }
        Ok(())
    }
}
