//! Process configuration.
//!
//! Everything a component needs is passed to its constructor from a
//! [`Settings`] value; nothing is read from ambient global state.

use crate::error::{Result, StoreError};
use crate::persist::{HashMismatchPolicy, PersistLimits};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub buckets: BucketSettings,
    pub limits: LimitSettings,
    pub buffer: BufferSettings,
    pub backup: BackupSettings,
    pub archive: ArchiveSettings,
    pub health_check: HealthCheckSettings,
    /// Base URL of the project history service used for resync requests.
    pub resync_url: Option<String>,
    pub content_hash_policy: HashMismatchPolicy,
    /// Number of blob contents kept in memory.
    pub blob_cache_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            buckets: BucketSettings::default(),
            limits: LimitSettings::default(),
            buffer: BufferSettings::default(),
            backup: BackupSettings::default(),
            archive: ArchiveSettings::default(),
            health_check: HealthCheckSettings::default(),
            resync_url: None,
            content_hash_policy: HashMismatchPolicy::default(),
            blob_cache_size: 1000,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let settings: Settings = serde_json::from_slice(&data)
            .map_err(|e| StoreError::Config(format!("{}: {e}", path.as_ref().display())))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings that would only fail later at first use.
    pub fn validate(&self) -> Result<()> {
        for key in &self.backup.root_keys {
            let bytes = hex::decode(key)
                .map_err(|e| StoreError::Config(format!("root key is not hex: {e}")))?;
            if bytes.len() != 32 {
                return Err(StoreError::Config(format!(
                    "root key must be 32 bytes, got {}",
                    bytes.len()
                )));
            }
        }
        if self.buffer.drain_batch_size == 0 {
            return Err(StoreError::Config("drain_batch_size must be positive".into()));
        }
        if self.limits.max_chunk_changes == 0 {
            return Err(StoreError::Config("max_chunk_changes must be positive".into()));
        }
        Ok(())
    }
}

/// Bucket names.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketSettings {
    pub chunks: String,
    pub blobs: String,
    pub global_blobs: String,
    pub backup_chunks: String,
    pub backup_blobs: String,
    pub backup_keys: String,
}

impl Default for BucketSettings {
    fn default() -> Self {
        Self {
            chunks: "history-chunks".into(),
            blobs: "history-blobs".into(),
            global_blobs: "history-global-blobs".into(),
            backup_chunks: "history-backup-chunks".into(),
            backup_blobs: "history-backup-blobs".into(),
            backup_keys: "history-backup-keys".into(),
        }
    }
}

/// Default persist limits, expressed as ages relative to the flush time.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    /// Changes younger than this are left in the buffer.
    pub min_change_age_secs: Option<i64>,
    /// A flush is forced once any eligible change is older than this.
    pub max_change_age_secs: Option<i64>,
    pub max_changes: Option<usize>,
    pub max_change_bytes: Option<usize>,
    pub max_chunk_changes: usize,
    pub max_chunk_change_bytes: usize,
    pub auto_resync: bool,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            min_change_age_secs: None,
            max_change_age_secs: None,
            max_changes: None,
            max_change_bytes: None,
            max_chunk_changes: 1000,
            max_chunk_change_bytes: 5 * 1024 * 1024,
            auto_resync: false,
        }
    }
}

impl LimitSettings {
    /// Concrete limits for a flush happening at `now`.
    pub fn limits_at(&self, now: DateTime<Utc>) -> PersistLimits {
        PersistLimits {
            min_change_timestamp: self
                .min_change_age_secs
                .map(|secs| now - Duration::seconds(secs)),
            max_change_timestamp: self
                .max_change_age_secs
                .map(|secs| now - Duration::seconds(secs)),
            max_changes: self.max_changes,
            max_change_bytes: self.max_change_bytes,
            max_chunk_changes: self.max_chunk_changes,
            max_chunk_change_bytes: self.max_chunk_change_bytes,
            auto_resync: self.auto_resync,
        }
    }
}

/// Write buffer timings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    /// Persisted changes kept in the buffer after a flush.
    pub max_persisted_changes: usize,
    /// How long an idle project stays buffered.
    pub project_ttl_secs: i64,
    /// Upper bound on how long queued changes wait for a background flush.
    pub max_persist_delay_secs: i64,
    /// Delay before a claimed but unfinished job may be claimed again.
    pub job_retry_delay_secs: i64,
    /// Changes drained per persist batch.
    pub drain_batch_size: usize,
    /// Keys requested per scan round trip.
    pub scan_count: usize,
    pub shards: usize,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            max_persisted_changes: 100,
            project_ttl_secs: 3600,
            max_persist_delay_secs: 300,
            job_retry_delay_secs: 120,
            drain_batch_size: 50,
            scan_count: 1000,
            shards: 3,
        }
    }
}

/// Backup pipeline settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Hex-encoded 256-bit root keys. Each project folder maps to one of
    /// them for wrapping; all of them unwrap.
    pub root_keys: Vec<String>,
    pub deletion_grace_days: i64,
    pub retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            root_keys: Vec::new(),
            deletion_grace_days: 90,
            retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveSettings {
    pub timeout_secs: u64,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self { timeout_secs: 600 }
    }
}

/// Pre-provisioned project and blob that must round-trip for liveness.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthSample {
    pub project_id: String,
    pub blob_hash: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckSettings {
    pub mongo_sample: Option<HealthSample>,
    pub postgres_sample: Option<HealthSample>,
}
