//! Error types for the history store.

use std::time::Duration;
use thiserror::Error;

/// Main error type for history store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The chunk row exists but its history was never written to the bucket.
    #[error("Chunk {chunk_id} of project {project_id} is not persisted")]
    NotPersisted { project_id: String, chunk_id: String },

    #[error("Conflicting end version: client has {client_end_version}, latest is {latest_end_version}")]
    ConflictingEndVersion {
        client_end_version: u64,
        latest_end_version: u64,
    },

    #[error("Chunk version conflict for project {project_id}: {detail}")]
    ChunkVersionConflict { project_id: String, detail: String },

    #[error("Buffer base version {base_version} does not match head version {head_version}")]
    BaseVersionConflict { base_version: u64, head_version: u64 },

    #[error("Version {version} out of bounds: {detail}")]
    VersionOutOfBounds { version: u64, detail: String },

    #[error("Invalid change: {0}")]
    InvalidChange(String),

    #[error("Content hash mismatch for {pathname}: expected {expected}, got {actual}")]
    ContentHashMismatch {
        pathname: String,
        expected: String,
        actual: String,
    },

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Backup corrupted at {path}: {reason}")]
    BackupCorrupted { path: String, reason: String },

    #[error("Backup RPO violation for project {project_id}: {detail}")]
    BackupRpoViolation { project_id: String, detail: String },

    #[error("Project {project_id} not ready to delete: {reason}")]
    NotReadyToDelete { project_id: String, reason: String },

    #[error("Failed to load {context}: {source}")]
    Load {
        context: String,
        #[source]
        source: Box<StoreError>,
    },

    #[error("Failed to store {context}: {source}")]
    Store {
        context: String,
        #[source]
        source: Box<StoreError>,
    },

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// A structural guarantee was broken; never retried.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Persistor is deletion-only and cannot access key material")]
    DeletionOnly,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Health check failed: {0}")]
    HealthCheck(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job not ready: {0}")]
    JobNotReady(String),

    #[error("Store is locked by another process")]
    Locked,
}

impl StoreError {
    /// Wrap a backend failure with load context.
    pub fn load(context: impl Into<String>, source: StoreError) -> Self {
        StoreError::Load {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Wrap a backend failure with store context.
    pub fn store(context: impl Into<String>, source: StoreError) -> Self {
        StoreError::Store {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// True for every "does not exist" condition, including wrapped ones.
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound(_) | StoreError::BlobNotFound(_) | StoreError::NotPersisted { .. } => {
                true
            }
            StoreError::Load { source, .. } | StoreError::Store { source, .. } => {
                source.is_not_found()
            }
            _ => false,
        }
    }

    /// True for both hard (structural) and soft (content hash) change failures.
    pub fn is_invalid_change(&self) -> bool {
        matches!(
            self,
            StoreError::InvalidChange(_) | StoreError::ContentHashMismatch { .. }
        )
    }

    /// True when the caller lost an optimistic-concurrency race and may retry.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::ConflictingEndVersion { .. }
                | StoreError::ChunkVersionConflict { .. }
                | StoreError::BaseVersionConflict { .. }
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            StoreError::Deserialization(e.to_string())
        } else {
            StoreError::Serialization(e.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Result type for history store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
