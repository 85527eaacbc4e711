//! Per-project write buffer.
//!
//! Recent changes are staged here, together with a hollow head snapshot,
//! before the persist pipeline folds them into chunks. All keys of a
//! project share its hash tag, so each operation below runs as one atomic
//! script on a single shard.

mod kv;

pub use kv::{KvStore, KvTxn, ScanCursor, ScanKeys};

use crate::config::BufferSettings;
use crate::error::{Result, StoreError};
use crate::model::{Change, Snapshot};
use crate::types::HistoryId;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use tracing::debug;

/// Buffer key schema.
pub mod keys {
    use crate::types::HistoryId;

    pub fn head(project_id: &HistoryId) -> String {
        format!("head:{{{project_id}}}")
    }

    pub fn head_version(project_id: &HistoryId) -> String {
        format!("head-version:{{{project_id}}}")
    }

    pub fn persisted_version(project_id: &HistoryId) -> String {
        format!("persisted-version:{{{project_id}}}")
    }

    pub fn expire_time(project_id: &HistoryId) -> String {
        format!("expire-time:{{{project_id}}}")
    }

    pub fn persist_time(project_id: &HistoryId) -> String {
        format!("persist-time:{{{project_id}}}")
    }

    pub fn changes(project_id: &HistoryId) -> String {
        format!("changes:{{{project_id}}}")
    }

    /// The project id inside a key's hash tag.
    pub fn project_of(key: &str) -> Option<&str> {
        let open = key.find('{')?;
        let close = key[open + 1..].find('}')?;
        Some(&key[open + 1..open + 1 + close])
    }

    pub(crate) fn all(project_id: &HistoryId) -> [String; 6] {
        [
            head(project_id),
            head_version(project_id),
            persisted_version(project_id),
            expire_time(project_id),
            persist_time(project_id),
            changes(project_id),
        ]
    }
}

/// The buffered head of a project.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeadSnapshot {
    pub snapshot: Snapshot,
    pub version: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct QueueOptions {
    /// Skip queuing when the project has no buffer entry yet.
    pub only_if_exists: bool,
    /// When the oldest queued change must be persisted. Defaults to now plus
    /// the configured persist delay; only ever moves earlier.
    pub persist_time: Option<DateTime<Utc>>,
    /// When the idle project expires. Defaults to now plus the project TTL.
    pub expire_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueStatus {
    Ok,
    /// Nothing was queued because of [`QueueOptions::only_if_exists`].
    Ignore,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangesSince {
    Ok(Vec<Change>),
    NotFound,
    OutOfBounds,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistedVersionStatus {
    Ok,
    NotFound,
    /// The stored persisted version is already higher.
    TooLow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpireStatus {
    NotFound,
    NotPersisted,
    Expired,
}

/// Everything stored for a project.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BufferState {
    pub head_snapshot: Option<Snapshot>,
    pub head_version: Option<u64>,
    pub persisted_version: Option<u64>,
    pub expire_time: Option<DateTime<Utc>>,
    pub persist_time: Option<DateTime<Utc>>,
    pub changes: Vec<Change>,
}

pub struct WriteBuffer {
    kv: Arc<KvStore>,
    settings: BufferSettings,
}

fn millis(ts: DateTime<Utc>) -> String {
    ts.timestamp_millis().to_string()
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn decode_changes(raw: &[String]) -> Result<Vec<Change>> {
    raw.iter().map(|json| Change::from_json(json)).collect()
}

impl WriteBuffer {
    pub fn new(kv: Arc<KvStore>, settings: BufferSettings) -> Self {
        Self { kv, settings }
    }

    pub fn kv(&self) -> &Arc<KvStore> {
        &self.kv
    }

    pub fn settings(&self) -> &BufferSettings {
        &self.settings
    }

    fn script<T>(&self, project_id: &HistoryId, f: impl FnOnce(&mut KvTxn<'_>) -> Result<T>) -> Result<T> {
        self.kv.with_shard(&keys::head_version(project_id), f)
    }

    /// The buffered head, or `None` on a cache miss.
    pub fn get_head_snapshot(&self, project_id: &HistoryId) -> Result<Option<HeadSnapshot>> {
        let raw = self.script(project_id, |txn| {
            let Some(version) = txn.get_u64(&keys::head_version(project_id))? else {
                return Ok(None);
            };
            Ok(Some((txn.get(&keys::head(project_id))?, version)))
        })?;
        match raw {
            None => Ok(None),
            Some((snapshot, version)) => {
                let snapshot = match snapshot {
                    Some(json) => serde_json::from_str(&json)?,
                    None => Snapshot::new(),
                };
                Ok(Some(HeadSnapshot { snapshot, version }))
            }
        }
    }

    /// Append `changes` on top of `base_version`, replacing the head
    /// snapshot. Fails with [`StoreError::BaseVersionConflict`] when the
    /// buffer's head has moved.
    pub fn queue_changes(
        &self,
        project_id: &HistoryId,
        head_snapshot: &Snapshot,
        base_version: u64,
        changes: &[Change],
        opts: QueueOptions,
    ) -> Result<QueueStatus> {
        if changes.is_empty() {
            return Err(StoreError::InvalidChange("cannot queue an empty batch of changes".into()));
        }
        let now = Utc::now();
        let persist_time = opts
            .persist_time
            .unwrap_or_else(|| now + Duration::seconds(self.settings.max_persist_delay_secs));
        let expire_time = opts
            .expire_time
            .unwrap_or_else(|| now + Duration::seconds(self.settings.project_ttl_secs));
        let head = serde_json::to_string(head_snapshot)?;
        let encoded = changes.iter().map(Change::to_json).collect::<Result<Vec<_>>>()?;
        let count = encoded.len() as u64;

        let status = self.script(project_id, |txn| {
            let head_version = txn.get_u64(&keys::head_version(project_id))?;
            match head_version {
                None if opts.only_if_exists => return Ok(QueueStatus::Ignore),
                Some(head_version) if head_version != base_version => {
                    return Err(StoreError::BaseVersionConflict {
                        base_version,
                        head_version,
                    })
                }
                _ => {}
            }

            txn.rpush(&keys::changes(project_id), encoded)?;
            txn.set(&keys::head(project_id), head);
            txn.set(&keys::head_version(project_id), (base_version + count).to_string());

            let persist_key = keys::persist_time(project_id);
            let sooner = match txn.get_i64(&persist_key)? {
                Some(current) => persist_time.timestamp_millis() < current,
                None => true,
            };
            if sooner {
                txn.set(&persist_key, millis(persist_time));
            }
            txn.set(&keys::expire_time(project_id), millis(expire_time));
            Ok(QueueStatus::Ok)
        })?;
        debug!(%project_id, base_version, count, ?status, "queued changes");
        Ok(status)
    }

    pub fn get_state(&self, project_id: &HistoryId) -> Result<BufferState> {
        let (head, head_version, persisted, expire, persist, changes) = self.script(project_id, |txn| {
            Ok((
                txn.get(&keys::head(project_id))?,
                txn.get_u64(&keys::head_version(project_id))?,
                txn.get_u64(&keys::persisted_version(project_id))?,
                txn.get_i64(&keys::expire_time(project_id))?,
                txn.get_i64(&keys::persist_time(project_id))?,
                txn.lrange(&keys::changes(project_id), 0, -1)?,
            ))
        })?;
        Ok(BufferState {
            head_snapshot: head.map(|json| serde_json::from_str(&json)).transpose()?,
            head_version,
            persisted_version: persisted,
            expire_time: expire.and_then(from_millis),
            persist_time: persist.and_then(from_millis),
            changes: decode_changes(&changes)?,
        })
    }

    /// All buffered changes after `version`, persisted or not.
    pub fn get_changes_since_version(&self, project_id: &HistoryId, version: u64) -> Result<ChangesSince> {
        let raw = self.script(project_id, |txn| {
            let Some(head_version) = txn.get_u64(&keys::head_version(project_id))? else {
                return Ok(None);
            };
            if version == head_version {
                return Ok(Some(Some(Vec::new())));
            }
            let changes_key = keys::changes(project_id);
            let count = txn.llen(&changes_key)? as u64;
            if version > head_version || version < head_version.saturating_sub(count) {
                return Ok(Some(None));
            }
            let start = version as i64 - head_version as i64;
            Ok(Some(Some(txn.lrange(&changes_key, start, -1)?)))
        })?;
        Ok(match raw {
            None => ChangesSince::NotFound,
            Some(None) => ChangesSince::OutOfBounds,
            Some(Some(changes)) => ChangesSince::Ok(decode_changes(&changes)?),
        })
    }

    /// Changes not yet persisted that apply on top of `base_version`, at
    /// most `max_changes` of them. A project without a buffer has none.
    pub fn get_non_persisted_changes(
        &self,
        project_id: &HistoryId,
        base_version: u64,
        max_changes: Option<usize>,
    ) -> Result<Vec<Change>> {
        let raw = self.script(project_id, |txn| {
            let Some(head_version) = txn.get_u64(&keys::head_version(project_id))? else {
                return Ok(Some(Vec::new()));
            };
            let changes_key = keys::changes(project_id);
            let persisted_version = match txn.get_u64(&keys::persisted_version(project_id))? {
                Some(v) => v,
                None => head_version.saturating_sub(txn.llen(&changes_key)? as u64),
            };
            if base_version < persisted_version || base_version > head_version {
                return Ok(None);
            }
            if base_version == head_version {
                return Ok(Some(Vec::new()));
            }

            let available = (head_version - base_version) as i64;
            let (end, expected) = match max_changes {
                Some(max) if max > 0 && (max as i64) < available => (-available + max as i64 - 1, max),
                _ => (-1, available as usize),
            };
            let changes = txn.lrange(&changes_key, -available, end)?;
            if changes.len() < expected {
                return Ok(None);
            }
            Ok(Some(changes))
        })?;
        match raw {
            Some(changes) => decode_changes(&changes),
            None => Err(StoreError::VersionOutOfBounds {
                version: base_version,
                detail: format!("non-persisted changes of project {project_id} cannot be applied"),
            }),
        }
    }

    /// Record that everything up to `version` is durable and trim the
    /// changes list to the configured number of persisted changes.
    pub fn set_persisted_version(&self, project_id: &HistoryId, version: u64) -> Result<PersistedVersionStatus> {
        let max_persisted = self.settings.max_persisted_changes as i64;
        let status = self.script(project_id, |txn| {
            let Some(head_version) = txn.get_u64(&keys::head_version(project_id))? else {
                return Ok(PersistedVersionStatus::NotFound);
            };
            let persisted_key = keys::persisted_version(project_id);
            if txn.get_u64(&persisted_key)?.is_some_and(|current| current > version) {
                return Ok(PersistedVersionStatus::TooLow);
            }
            if version > head_version {
                return Err(StoreError::VersionOutOfBounds {
                    version,
                    detail: format!("persisted version above head version {head_version}"),
                });
            }
            txn.set(&persisted_key, version.to_string());
            if version == head_version {
                txn.del(&[keys::persist_time(project_id).as_str()]);
            }
            let start = version as i64 - head_version as i64 - max_persisted;
            if start < 0 {
                txn.ltrim(&keys::changes(project_id), start, -1)?;
            }
            Ok(PersistedVersionStatus::Ok)
        })?;
        debug!(%project_id, version, ?status, "set persisted version");
        Ok(status)
    }

    /// Drop a project's buffer once everything in it is persisted.
    pub fn expire_project(&self, project_id: &HistoryId) -> Result<ExpireStatus> {
        self.script(project_id, |txn| {
            let Some(head_version) = txn.get_u64(&keys::head_version(project_id))? else {
                return Ok(ExpireStatus::NotFound);
            };
            if txn.get_u64(&keys::persisted_version(project_id))? != Some(head_version) {
                return Ok(ExpireStatus::NotPersisted);
            }
            let all = keys::all(project_id);
            txn.del(&all.iter().map(String::as_str).collect::<Vec<_>>());
            Ok(ExpireStatus::Expired)
        })
    }

    /// Set the expire time, only if the project is buffered.
    pub fn set_expire_time(&self, project_id: &HistoryId, expire_time: DateTime<Utc>) -> Result<()> {
        self.script(project_id, |txn| {
            if txn.get(&keys::head_version(project_id))?.is_some() {
                txn.set(&keys::expire_time(project_id), millis(expire_time));
            }
            Ok(())
        })
    }

    /// Remove every key of a permanently deleted project, including
    /// changes that were never persisted.
    pub fn hard_delete_project(&self, project_id: &HistoryId) -> Result<()> {
        self.script(project_id, |txn| {
            let all = keys::all(project_id);
            txn.del(&all.iter().map(String::as_str).collect::<Vec<_>>());
            Ok(())
        })
    }

    pub fn claim_persist_job(&self, project_id: &HistoryId) -> Result<Job> {
        self.claim_job(keys::persist_time(project_id))
    }

    pub fn claim_expire_job(&self, project_id: &HistoryId) -> Result<Job> {
        self.claim_job(keys::expire_time(project_id))
    }

    fn claim_job(&self, key: String) -> Result<Job> {
        let now = Utc::now().timestamp_millis();
        let retry_delay = self.settings.job_retry_delay_secs * 1000;
        let claimed = self.kv.with_shard(&key, |txn| {
            let Some(job_time) = txn.get_i64(&key)? else {
                return Err(StoreError::JobNotFound(key.clone()));
            };
            if job_time > now {
                return Err(StoreError::JobNotReady(format!("{key} ready in {}ms", job_time - now)));
            }
            let retry_time = now + retry_delay;
            txn.set(&key, retry_time.to_string());
            Ok(retry_time)
        })?;
        Ok(Job {
            kv: Arc::clone(&self.kv),
            key,
            claim_time: claimed,
        })
    }
}

/// A claimed persist or expire job.
pub struct Job {
    kv: Arc<KvStore>,
    key: String,
    claim_time: i64,
}

impl Job {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Delete the job key unless someone rescheduled it since the claim.
    pub fn close(&self) -> Result<()> {
        self.kv.with_shard(&self.key, |txn| {
            if txn.get_i64(&self.key)? == Some(self.claim_time) {
                txn.del(&[self.key.as_str()]);
            }
            Ok(())
        })
    }
}
