//! Compressed chunk history payloads in the chunk bucket.

use crate::error::{Result, StoreError};
use crate::model::History;
use crate::storage::keys::chunk_key;
use crate::storage::ObjectStore;
use crate::types::{ChunkId, HistoryId};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, warn};

/// Reads and writes the raw history owned by each chunk.
///
/// Payloads are gzip-compressed JSON stored under
/// `project-folder/padded-chunk-id`.
#[derive(Clone)]
pub struct HistoryStore {
    objects: Arc<dyn ObjectStore>,
    bucket: String,
}

impl HistoryStore {
    pub fn new(objects: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            objects,
            bucket: bucket.into(),
        }
    }

    pub fn store_raw(&self, project_id: &HistoryId, chunk_id: &ChunkId, history: &History) -> Result<()> {
        let context = || format!("history for project {project_id} chunk {chunk_id}");
        let buffer = encode(history).map_err(|e| StoreError::store(context(), e))?;
        self.objects
            .put(&self.bucket, &chunk_key(project_id, chunk_id), &buffer)
            .map_err(|e| StoreError::store(context(), e))?;
        debug!(%project_id, %chunk_id, bytes = buffer.len(), "stored chunk history");
        Ok(())
    }

    pub fn load_raw(&self, project_id: &HistoryId, chunk_id: &ChunkId) -> Result<History> {
        let buffer = self.load_raw_with_buffer(project_id, chunk_id)?;
        decode(&buffer).map_err(|e| {
            StoreError::load(format!("history for project {project_id} chunk {chunk_id}"), e)
        })
    }

    /// The compressed payload exactly as stored.
    pub fn load_raw_with_buffer(&self, project_id: &HistoryId, chunk_id: &ChunkId) -> Result<Vec<u8>> {
        self.objects
            .get(&self.bucket, &chunk_key(project_id, chunk_id))
            .map_err(|e| {
                if e.is_not_found() {
                    StoreError::NotPersisted {
                        project_id: project_id.to_string(),
                        chunk_id: chunk_id.to_string(),
                    }
                } else {
                    StoreError::load(format!("history for project {project_id} chunk {chunk_id}"), e)
                }
            })
    }

    /// Delete many payloads. Every deletion is attempted; any failure fails
    /// the whole call.
    pub fn delete_chunks(&self, chunks: &[(HistoryId, ChunkId)]) -> Result<()> {
        let mut failures = 0usize;
        let mut last_error = None;
        for (project_id, chunk_id) in chunks {
            if let Err(e) = self.objects.delete(&self.bucket, &chunk_key(project_id, chunk_id)) {
                warn!(%project_id, %chunk_id, error = %e, "failed to delete chunk history");
                failures += 1;
                last_error = Some(e);
            }
        }
        match last_error {
            None => Ok(()),
            Some(e) => Err(StoreError::store(
                format!("deletion of {failures} of {} chunk histories", chunks.len()),
                e,
            )),
        }
    }
}

/// Serialize and compress a history.
pub fn encode(history: &History) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(history)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Decompress and parse a history payload.
pub fn decode(buffer: &[u8]) -> Result<History> {
    let mut json = Vec::new();
    GzDecoder::new(buffer)
        .read_to_end(&mut json)
        .map_err(|e| StoreError::Corruption(format!("bad chunk payload: {e}")))?;
    Ok(serde_json::from_slice(&json)?)
}
