//! Chunk splitting.

use super::{HashMismatchPolicy, PersistLimits, Persister};
use crate::blobs::BlobStore;
use crate::error::{Result, StoreError};
use crate::model::{Change, Chunk, History, LoadMode, Operation, Snapshot};
use crate::types::HistoryId;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Outcome of a flush.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistResult {
    pub number_of_changes_persisted: usize,
    /// End version of the latest chunk before the flush.
    pub original_end_version: u64,
    /// The latest chunk after the flush.
    pub current_chunk: Chunk,
    /// Replayed content disagreed with an expected content hash.
    pub resync_needed: bool,
}

impl Persister {
    /// Fold `changes` into the latest chunk and as many new chunks as the
    /// chunk limits require.
    ///
    /// Only changes older than `limits.min_change_timestamp` are considered,
    /// and nothing happens (`Ok(None)`) unless they are due for a flush. The
    /// latest chunk must end at `client_end_version`.
    pub fn persist_changes(
        &self,
        project_id: &HistoryId,
        mut changes: Vec<Change>,
        limits: &PersistLimits,
        client_end_version: u64,
    ) -> Result<Option<PersistResult>> {
        changes.truncate(limits.eligible_count(&changes));
        let total_bytes = changes.iter().map(Change::serialized_size).sum::<Result<usize>>()?;
        if !limits.should_flush(&changes, total_bytes) {
            debug!(%project_id, eligible = changes.len(), total_bytes, "nothing due for persisting");
            return Ok(None);
        }

        let mut chunk = self.chunks.load_latest(project_id, true)?;
        let original_end_version = chunk.end_version();
        if original_end_version != client_end_version {
            return Err(StoreError::ConflictingEndVersion {
                client_end_version,
                latest_end_version: original_end_version,
            });
        }

        let blobs = self.blobs.for_project(project_id);
        let number_of_changes_persisted = changes.len();
        let mut filler = ChunkFiller {
            project_id,
            blobs: &blobs,
            limits,
            policy: self.policy,
            snapshot: chunk.end_snapshot(false)?,
            pending: changes.into(),
            mismatch_logged: false,
            resync_needed: false,
        };

        if filler.fill(&mut chunk)? > 0 {
            self.chunks.update(project_id, original_end_version, &chunk)?;
        }
        while !filler.pending.is_empty() {
            filler.snapshot.store_files(&blobs)?;
            let mut next = Chunk::new(
                History::new(filler.snapshot.clone(), Vec::new()),
                chunk.end_version(),
            );
            if filler.fill(&mut next)? == 0 {
                return Err(StoreError::Invariant(format!(
                    "could not fill chunk at version {} of project {project_id}",
                    next.start_version()
                )));
            }
            self.chunks.create(project_id, &next)?;
            chunk = next;
        }

        debug!(
            %project_id,
            persisted = number_of_changes_persisted,
            original_end_version,
            end_version = chunk.end_version(),
            "persisted changes"
        );
        Ok(Some(PersistResult {
            number_of_changes_persisted,
            original_end_version,
            current_chunk: chunk,
            resync_needed: filler.resync_needed,
        }))
    }
}

/// Moves pending changes into chunks while tracking the running snapshot.
struct ChunkFiller<'a> {
    project_id: &'a HistoryId,
    blobs: &'a BlobStore,
    limits: &'a PersistLimits,
    policy: HashMismatchPolicy,
    snapshot: Snapshot,
    pending: VecDeque<Change>,
    mismatch_logged: bool,
    resync_needed: bool,
}

impl ChunkFiller<'_> {
    /// Append pending changes to `chunk` until a chunk limit is reached.
    /// Returns the number appended.
    fn fill(&mut self, chunk: &mut Chunk) -> Result<usize> {
        let mut bytes = chunk
            .changes()
            .iter()
            .map(Change::serialized_size)
            .sum::<Result<usize>>()?;
        let mut added = 0;
        while let Some(next) = self.pending.front_mut() {
            // size the change as it will be stored, with content moved to blobs
            next.store_files(self.blobs)?;
            let size = next.serialized_size()?;
            if chunk.changes().len() >= self.limits.max_chunk_changes
                || bytes + size > self.limits.max_chunk_change_bytes
            {
                break;
            }
            let Some(mut change) = self.pending.pop_front() else {
                break;
            };
            self.apply(&mut change)?;
            chunk.push_change(change);
            bytes += size;
            added += 1;
        }
        Ok(added)
    }

    fn apply(&mut self, change: &mut Change) -> Result<()> {
        for op in change.operations_mut() {
            op.apply_to(&mut self.snapshot, true)?;
            if let Operation::EditFile {
                pathname,
                content_hash,
                ..
            } = op
            {
                if let Some(expected) = content_hash.take() {
                    self.check_content_hash(pathname, expected)?;
                }
            }
        }
        Ok(())
    }

    fn check_content_hash(&mut self, pathname: &str, expected: String) -> Result<()> {
        let file = self
            .snapshot
            .file_mut(pathname)
            .ok_or_else(|| StoreError::InvalidChange(format!("file not found: {pathname}")))?;
        file.load(LoadMode::Eager, self.blobs)?;
        let actual = file.content_hash().unwrap_or_else(|| "unloaded".to_string());
        if actual == expected {
            return Ok(());
        }

        let mismatch = StoreError::ContentHashMismatch {
            pathname: pathname.to_string(),
            expected,
            actual,
        };
        match self.policy {
            HashMismatchPolicy::Strict => Err(mismatch),
            HashMismatchPolicy::Lenient => {
                if !self.mismatch_logged {
                    warn!(project_id = %self.project_id, error = %mismatch, "ignoring content hash mismatch");
                    self.mismatch_logged = true;
                }
                self.resync_needed = true;
                Ok(())
            }
        }
    }
}
