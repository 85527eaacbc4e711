//! Bucket-style object storage.
//!
//! Every backend maps a missing object to [`StoreError::NotFound`] so callers
//! can distinguish "never written" from "backend unavailable".
//!
//! [`StoreError::NotFound`]: crate::error::StoreError::NotFound

pub mod keys;
mod local;
mod memory;

pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;

use crate::error::Result;
use std::io::{Cursor, Read};

/// A listed object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

/// Storage of opaque objects in named buckets.
pub trait ObjectStore: Send + Sync {
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    fn get_stream(&self, bucket: &str, key: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.get(bucket, key)?)))
    }

    fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()>;

    /// Delete one object. Deleting a missing object succeeds.
    fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Delete every object whose key starts with `prefix`.
    fn delete_directory(&self, bucket: &str, prefix: &str) -> Result<()> {
        for object in self.list(bucket, prefix)? {
            self.delete(bucket, &object.key)?;
        }
        Ok(())
    }

    /// Objects whose key starts with `prefix`, sorted by key.
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>>;

    fn exists(&self, bucket: &str, key: &str) -> Result<bool>;
}

pub(crate) fn not_found(bucket: &str, key: &str) -> crate::error::StoreError {
    crate::error::StoreError::NotFound(format!("{bucket}/{key}"))
}
