//! Content-addressed blob storage.
//!
//! Blobs are keyed by their git blob hash. A fixed table of global blobs is
//! consulted first; everything else is stored per project, with metadata in
//! the project's metadata backend and content in the blob bucket.

mod batch;
mod global;
pub mod hash;
mod store;

pub use batch::BatchBlobStore;
pub use global::{GlobalBlob, GlobalBlobs};
pub use store::{BlobService, BlobStore};

use crate::error::Result;
use crate::types::BlobHash;
use serde::{Deserialize, Serialize};

/// Blob metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub hash: BlobHash,
    pub byte_length: u64,
    /// Character count for text content; `None` for binary content.
    pub string_length: Option<usize>,
}

/// Where file loading fetches content and metadata from.
pub trait BlobSource {
    fn get_blob(&self, hash: &BlobHash) -> Result<Option<Blob>>;
    fn get_string(&self, hash: &BlobHash) -> Result<String>;
}
