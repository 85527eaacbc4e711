//! Changes: atomic, timestamped groups of operations.

use crate::blobs::{BlobSource, BlobStore};
use crate::error::Result;
use crate::model::{LoadMode, Operation, Snapshot};
use crate::types::BlobHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Origin kind of changes produced by a history resync.
pub const RESYNC_ORIGIN: &str = "history-resync";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub kind: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    operations: Vec<Operation>,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin: Option<Origin>,
}

impl Change {
    pub fn new(operations: Vec<Operation>, timestamp: DateTime<Utc>) -> Self {
        Self {
            operations,
            timestamp,
            origin: None,
        }
    }

    pub fn with_origin(mut self, kind: impl Into<String>) -> Self {
        self.origin = Some(Origin { kind: kind.into() });
        self
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn operations_mut(&mut self) -> &mut [Operation] {
        &mut self.operations
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn origin(&self) -> Option<&Origin> {
        self.origin.as_ref()
    }

    pub fn is_resync(&self) -> bool {
        self.origin.as_ref().is_some_and(|o| o.kind == RESYNC_ORIGIN)
    }

    /// Canonical JSON encoding. Field order is fixed by the struct layout so
    /// equal changes always encode identically.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Encoded size used for chunk byte limits.
    pub fn serialized_size(&self) -> Result<usize> {
        Ok(self.to_json()?.len())
    }

    pub fn apply_to(&self, snapshot: &mut Snapshot, strict: bool) -> Result<()> {
        for op in &self.operations {
            op.apply_to(snapshot, strict)?;
        }
        Ok(())
    }

    /// Collect blob hashes referenced by added files.
    pub fn find_blob_hashes(&self, hashes: &mut BTreeSet<BlobHash>) {
        for op in &self.operations {
            if let Operation::AddFile { file, .. } = op {
                if let Some(hash) = file.base_hash() {
                    hashes.insert(hash);
                }
            }
        }
    }

    pub fn load_files(&mut self, mode: LoadMode, source: &dyn BlobSource) -> Result<()> {
        for op in &mut self.operations {
            if let Operation::AddFile { file, .. } = op {
                file.load(mode, source)?;
            }
        }
        Ok(())
    }

    pub fn store_files(&mut self, blobs: &BlobStore) -> Result<()> {
        for op in &mut self.operations {
            if let Operation::AddFile { file, .. } = op {
                file.store(blobs)?;
            }
        }
        Ok(())
    }
}
