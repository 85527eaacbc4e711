//! Liveness check against pre-provisioned sample projects.

use crate::blobs::hash::git_blob_hash_reader;
use crate::blobs::BlobService;
use crate::chunks::ChunkStore;
use crate::config::{HealthCheckSettings, HealthSample};
use crate::error::{Result, StoreError};
use crate::types::{BlobHash, HistoryId};
use tracing::{debug, error, warn};

/// Round-trip each configured sample: its latest chunk must load and its
/// sample blob must re-hash to its own id. Fails when none is configured.
pub fn check(chunks: &ChunkStore, blobs: &BlobService, settings: &HealthCheckSettings) -> Result<()> {
    let samples = [
        ("mongo", settings.mongo_sample.as_ref()),
        ("postgres", settings.postgres_sample.as_ref()),
    ];
    if samples.iter().all(|(_, sample)| sample.is_none()) {
        warn!("health check has no samples configured");
        return Err(StoreError::HealthCheck("no samples configured".into()));
    }
    for (backend, sample) in samples {
        let Some(sample) = sample else {
            continue;
        };
        check_sample(chunks, blobs, sample).map_err(|e| {
            error!(backend, project_id = %sample.project_id, error = %e, "health check failed");
            StoreError::HealthCheck(format!("{backend} sample {}: {e}", sample.project_id))
        })?;
        debug!(backend, project_id = %sample.project_id, "health check passed");
    }
    Ok(())
}

fn check_sample(chunks: &ChunkStore, blobs: &BlobService, sample: &HealthSample) -> Result<()> {
    let project_id = HistoryId::parse(&sample.project_id)?;
    let hash = BlobHash::from_hex(&sample.blob_hash)?;
    chunks.load_latest(&project_id, true)?;

    let store = blobs.for_project(&project_id);
    let blob = store
        .get_blob(&hash)?
        .ok_or_else(|| StoreError::BlobNotFound(hash.to_hex()))?;
    let actual = git_blob_hash_reader(store.get_stream(&hash)?, blob.byte_length)?;
    if actual != hash {
        return Err(StoreError::Corruption(format!("blob {hash} hashes to {actual}")));
    }
    Ok(())
}
