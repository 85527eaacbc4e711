//! Histories and chunks.

use crate::blobs::BlobSource;
use crate::error::Result;
use crate::model::{Change, LoadMode, Snapshot};
use crate::types::{BlobHash, ChunkId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A snapshot plus the changes that advance it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    snapshot: Snapshot,
    changes: Vec<Change>,
}

impl History {
    pub fn new(snapshot: Snapshot, changes: Vec<Change>) -> Self {
        Self { snapshot, changes }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn push_change(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn find_blob_hashes(&self, hashes: &mut BTreeSet<BlobHash>) {
        self.snapshot.find_blob_hashes(hashes);
        for change in &self.changes {
            change.find_blob_hashes(hashes);
        }
    }

    pub fn load_files(&mut self, mode: LoadMode, source: &dyn BlobSource) -> Result<()> {
        self.snapshot.load_files(mode, source)?;
        for change in &mut self.changes {
            change.load_files(mode, source)?;
        }
        Ok(())
    }
}

/// A contiguous version range of a project's history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    history: History,
    start_version: u64,
}

impl Chunk {
    pub fn new(history: History, start_version: u64) -> Self {
        Self {
            history,
            start_version,
        }
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn snapshot(&self) -> &Snapshot {
        self.history.snapshot()
    }

    pub fn changes(&self) -> &[Change] {
        self.history.changes()
    }

    pub fn start_version(&self) -> u64 {
        self.start_version
    }

    pub fn end_version(&self) -> u64 {
        self.start_version + self.history.changes.len() as u64
    }

    /// Timestamp of the last change, if any.
    pub fn end_timestamp(&self) -> Option<DateTime<Utc>> {
        self.history.changes.last().map(|c| c.timestamp())
    }

    pub fn push_change(&mut self, change: Change) {
        self.history.push_change(change);
    }

    /// Snapshot at the end of the chunk.
    pub fn end_snapshot(&self, strict: bool) -> Result<Snapshot> {
        let mut snapshot = self.history.snapshot.clone();
        snapshot.apply_all(&self.history.changes, strict)?;
        Ok(snapshot)
    }

    pub fn into_history(self) -> History {
        self.history
    }
}

/// Metadata row describing a stored chunk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: ChunkId,
    pub start_version: u64,
    pub end_version: u64,
    pub end_timestamp: Option<DateTime<Utc>>,
}
