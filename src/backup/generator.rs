//! Forward walk over the chunks a backup still needs.

use crate::blobs::{Blob, BlobStore, GlobalBlobs};
use crate::chunks::{ChunkRecords, ChunkStore};
use crate::error::{Result, StoreError};
use crate::model::{Chunk, ChunkRecord};
use crate::types::{BlobHash, HistoryId};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// One chunk to back up together with the blobs it introduces.
#[derive(Debug)]
pub struct BackupItem {
    pub record: ChunkRecord,
    pub chunk: Chunk,
    /// The stored payload, copied to the backup as is.
    pub buffer: Vec<u8>,
    pub blobs: Vec<Blob>,
}

/// Yields the chunks after `last_backed_up_version`, each with the blobs
/// not already covered by an earlier chunk.
///
/// The walk only goes forward. When the previous backup ended exactly at
/// the first chunk's start, the previous chunk is read once to learn which
/// blobs it already carried. When the previous backup ended inside the
/// first chunk (the chunk was extended since), its already backed-up prefix
/// is treated as seen.
pub struct BackupGenerator<'a> {
    chunks: &'a ChunkStore,
    blobs: &'a BlobStore,
    globals: &'a GlobalBlobs,
    project_id: HistoryId,
    records: ChunkRecords<'a>,
    last_backed_up_version: Option<u64>,
    seen: BTreeSet<BlobHash>,
    first: bool,
    done: bool,
}

impl<'a> BackupGenerator<'a> {
    pub fn new(
        chunks: &'a ChunkStore,
        blobs: &'a BlobStore,
        globals: &'a GlobalBlobs,
        last_backed_up_version: Option<u64>,
    ) -> Self {
        let project_id = blobs.project_id().clone();
        let from = last_backed_up_version.map_or(0, |v| v + 1);
        Self {
            chunks,
            blobs,
            globals,
            records: chunks.get_project_chunks_from_version(&project_id, from),
            project_id,
            last_backed_up_version,
            seen: BTreeSet::new(),
            first: true,
            done: false,
        }
    }

    /// End version of the last chunk yielded, or the starting watermark.
    pub fn last_backed_up_version(&self) -> Option<u64> {
        self.last_backed_up_version
    }

    fn look_behind(&mut self, chunk: &Chunk) -> Result<()> {
        let Some(last) = self.last_backed_up_version else {
            return Ok(());
        };
        let start = chunk.start_version();
        if start == last && last > 0 {
            let previous = self.chunks.load_at_version(&self.project_id, last)?;
            if previous.end_version() != start {
                return Err(StoreError::Invariant(format!(
                    "chunk before version {start} of project {} ends at {}",
                    self.project_id,
                    previous.end_version()
                )));
            }
            previous.history().find_blob_hashes(&mut self.seen);
            debug!(project_id = %self.project_id, start, seen = self.seen.len(), "looked behind chunk boundary");
        } else if start < last {
            let backed_up = (last - start) as usize;
            chunk.snapshot().find_blob_hashes(&mut self.seen);
            for change in chunk.changes().iter().take(backed_up) {
                change.find_blob_hashes(&mut self.seen);
            }
        }
        Ok(())
    }

    fn item(&mut self, record: ChunkRecord) -> Result<BackupItem> {
        let (chunk, buffer) = self.chunks.load_buffer_by_record(&self.project_id, &record)?;
        if self.first {
            self.first = false;
            self.look_behind(&chunk)?;
        }

        let mut hashes = BTreeSet::new();
        chunk.history().find_blob_hashes(&mut hashes);
        let new: Vec<BlobHash> = hashes
            .into_iter()
            .filter(|h| !self.seen.contains(h) && !self.globals.is_active(h))
            .collect();
        let blobs = self.blobs.get_blobs(&new)?;
        if blobs.len() != new.len() {
            warn!(
                project_id = %self.project_id,
                chunk = %record.id,
                expected = new.len(),
                found = blobs.len(),
                "blob metadata missing for chunk"
            );
        }
        self.seen.extend(new);
        self.last_backed_up_version = Some(record.end_version);
        Ok(BackupItem {
            record,
            chunk,
            buffer,
            blobs,
        })
    }
}

impl Iterator for BackupGenerator<'_> {
    type Item = Result<BackupItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = match self.records.next()? {
            Ok(record) => self.item(record),
            Err(e) => Err(e),
        };
        self.done = item.is_err();
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{fixture, persist_files, GLOBAL_CONTENT};
    use super::*;

    fn hashes(item: &BackupItem) -> Vec<BlobHash> {
        let mut hashes: Vec<_> = item.blobs.iter().map(|b| b.hash).collect();
        hashes.sort();
        hashes
    }

    fn walk(f: &super::super::testing::Fixture, project_id: &HistoryId, last: Option<u64>) -> Vec<BackupItem> {
        let chunks = f.persister.chunks();
        let blobs = f.persister.blobs().for_project(project_id);
        BackupGenerator::new(chunks, &blobs, f.persister.blobs().globals(), last)
            .collect::<Result<_>>()
            .unwrap()
    }

    #[test]
    fn test_new_blobs_per_chunk() {
        let f = fixture();
        let project_id = HistoryId::Postgres(31);
        persist_files(
            &f,
            &project_id,
            &[("a.tex", "alpha"), ("b.tex", "beta"), ("c.tex", "alpha"), ("main.tex", GLOBAL_CONTENT)],
            2,
        );

        let items = walk(&f, &project_id, None);
        let ranges: Vec<_> = items
            .iter()
            .map(|i| (i.record.start_version, i.record.end_version))
            .collect();
        assert_eq!(ranges, vec![(0, 2), (2, 4)]);
        let mut expected = vec![BlobHash::of_content(b"alpha"), BlobHash::of_content(b"beta")];
        expected.sort();
        assert_eq!(hashes(&items[0]), expected);
        // "alpha" was carried by the first chunk and the global blob is skipped
        assert!(items[1].blobs.is_empty());
        assert!(!items[0].buffer.is_empty());
    }

    #[test]
    fn test_look_behind_at_chunk_boundary() {
        let f = fixture();
        let project_id = HistoryId::Postgres(32);
        persist_files(&f, &project_id, &[("a.tex", "alpha"), ("b.tex", "beta")], 2);
        persist_files(&f, &project_id, &[("c.tex", "alpha"), ("d.tex", "delta")], 2);

        let items = walk(&f, &project_id, Some(2));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].record.start_version, 2);
        assert_eq!(hashes(&items[0]), vec![BlobHash::of_content(b"delta")]);
    }

    #[test]
    fn test_extended_chunk_skips_backed_up_prefix() {
        let f = fixture();
        let project_id = HistoryId::Postgres(33);
        persist_files(&f, &project_id, &[("a.tex", "alpha")], 10);
        persist_files(&f, &project_id, &[("b.tex", "alpha"), ("c.tex", "gamma")], 10);

        let items = walk(&f, &project_id, Some(1));
        assert_eq!(items.len(), 1);
        assert_eq!((items[0].record.start_version, items[0].record.end_version), (0, 3));
        assert_eq!(hashes(&items[0]), vec![BlobHash::of_content(b"gamma")]);
    }

    #[test]
    fn test_up_to_date_yields_nothing() {
        let f = fixture();
        let project_id = HistoryId::Postgres(34);
        persist_files(&f, &project_id, &[("a.tex", "alpha")], 10);
        assert!(walk(&f, &project_id, Some(1)).is_empty());
    }
}
