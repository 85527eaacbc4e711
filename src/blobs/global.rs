//! Globally shared blobs.

use crate::blobs::Blob;
use crate::types::BlobHash;
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalBlob {
    pub blob: Blob,
    /// A demoted blob is stored per project again and is backed up like
    /// any other blob.
    pub demoted: bool,
}

/// Read-only table of global blobs, loaded once at startup.
#[derive(Clone, Debug, Default)]
pub struct GlobalBlobs {
    blobs: HashMap<BlobHash, GlobalBlob>,
}

impl GlobalBlobs {
    pub fn new(blobs: impl IntoIterator<Item = GlobalBlob>) -> Self {
        Self {
            blobs: blobs.into_iter().map(|g| (g.blob.hash, g)).collect(),
        }
    }

    pub fn get(&self, hash: &BlobHash) -> Option<&GlobalBlob> {
        self.blobs.get(hash)
    }

    /// Global and not demoted: served from the global bucket and never
    /// copied into project backups.
    pub fn is_active(&self, hash: &BlobHash) -> bool {
        self.blobs.get(hash).is_some_and(|g| !g.demoted)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}
