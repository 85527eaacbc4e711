//! In-process object store.

use super::{not_found, ObjectInfo, ObjectStore};
use crate::error::Result;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Object store held entirely in memory.
#[derive(Default)]
pub struct MemoryObjectStore {
    buckets: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of objects across all buckets.
    pub fn object_count(&self) -> usize {
        self.buckets.read().values().map(|b| b.len()).sum()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.buckets
            .read()
            .get(bucket)
            .and_then(|b| b.get(key))
            .cloned()
            .ok_or_else(|| not_found(bucket, key))
    }

    fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()> {
        self.buckets
            .write()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        if let Some(b) = self.buckets.write().get_mut(bucket) {
            b.remove(key);
        }
        Ok(())
    }

    fn delete_directory(&self, bucket: &str, prefix: &str) -> Result<()> {
        if let Some(b) = self.buckets.write().get_mut(bucket) {
            b.retain(|key, _| !key.starts_with(prefix));
        }
        Ok(())
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let buckets = self.buckets.read();
        let Some(b) = buckets.get(bucket) else {
            return Ok(Vec::new());
        };
        Ok(b
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, data)| ObjectInfo {
                key: key.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self
            .buckets
            .read()
            .get(bucket)
            .is_some_and(|b| b.contains_key(key)))
    }
}
