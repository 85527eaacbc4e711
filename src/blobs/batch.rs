//! Batched blob metadata lookups.

use crate::blobs::{Blob, BlobSource, BlobStore};
use crate::error::Result;
use crate::types::BlobHash;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Wraps a [`BlobStore`], serving metadata for a preloaded hash set from
/// memory and falling back to the store on a miss.
pub struct BatchBlobStore<'a> {
    store: &'a BlobStore,
    blobs: Mutex<HashMap<BlobHash, Blob>>,
}

impl<'a> BatchBlobStore<'a> {
    pub fn new(store: &'a BlobStore) -> Self {
        Self {
            store,
            blobs: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch metadata for all uncached hashes in one call.
    pub fn preload(&self, hashes: impl IntoIterator<Item = BlobHash>) -> Result<()> {
        let missing: Vec<BlobHash> = {
            let blobs = self.blobs.lock();
            hashes.into_iter().filter(|h| !blobs.contains_key(h)).collect()
        };
        if missing.is_empty() {
            return Ok(());
        }
        let found = self.store.get_blobs(&missing)?;
        let mut blobs = self.blobs.lock();
        for blob in found {
            blobs.insert(blob.hash, blob);
        }
        Ok(())
    }

    pub fn cached(&self) -> usize {
        self.blobs.lock().len()
    }
}

impl BlobSource for BatchBlobStore<'_> {
    fn get_blob(&self, hash: &BlobHash) -> Result<Option<Blob>> {
        if let Some(blob) = self.blobs.lock().get(hash) {
            return Ok(Some(blob.clone()));
        }
        let blob = self.store.get_blob(hash)?;
        if let Some(blob) = &blob {
            self.blobs.lock().insert(*hash, blob.clone());
        }
        Ok(blob)
    }

    fn get_string(&self, hash: &BlobHash) -> Result<String> {
        self.store.get_string(hash)
    }
}
