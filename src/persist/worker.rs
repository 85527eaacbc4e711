//! Background flushing of the write buffer.

use super::{PersistLimits, Persister};
use crate::buffer::{keys, ExpireStatus};
use crate::config::LimitSettings;
use crate::error::{Result, StoreError};
use crate::types::HistoryId;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Counts from one pass of [`BufferWorker::run_once`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub persisted: usize,
    pub expired: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Projects whose buffered changes may have reached the chunk store.
    pub flushed: Vec<HistoryId>,
}

/// Drains projects whose persist time has passed and drops projects whose
/// expire time has passed.
///
/// A job that fails is left claimed; it becomes claimable again once the
/// buffer's retry delay elapses.
pub struct BufferWorker {
    persister: Arc<Persister>,
    limits: LimitSettings,
}

impl BufferWorker {
    pub fn new(persister: Arc<Persister>, limits: LimitSettings) -> Self {
        Self { persister, limits }
    }

    pub fn run_once(&self) -> Result<WorkerReport> {
        let mut report = WorkerReport::default();
        for project_id in self.due_projects("persist-time:*") {
            match self.persist_job(&project_id) {
                Ok(true) => {
                    report.persisted += 1;
                    report.flushed.push(project_id);
                }
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    error!(%project_id, error = %e, "persist job failed");
                    report.failed += 1;
                }
            }
        }
        for project_id in self.due_projects("expire-time:*") {
            match self.expire_job(&project_id) {
                Ok(true) => {
                    report.expired += 1;
                    report.flushed.push(project_id);
                }
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    error!(%project_id, error = %e, "expire job failed");
                    report.failed += 1;
                }
            }
        }
        debug!(?report, "buffer worker pass finished");
        Ok(report)
    }

    fn due_projects(&self, pattern: &str) -> Vec<HistoryId> {
        let buffer = self.persister.buffer();
        let scan_count = buffer.settings().scan_count;
        let mut projects = Vec::new();
        for batch in buffer.kv().scan_keys(pattern, scan_count) {
            for key in batch {
                match keys::project_of(&key).map(HistoryId::parse) {
                    Some(Ok(project_id)) => projects.push(project_id),
                    _ => warn!(%key, "skipping buffer key without a valid project id"),
                }
            }
        }
        projects
    }

    fn persist_job(&self, project_id: &HistoryId) -> Result<bool> {
        let Some(job) = claimed(self.persister.buffer().claim_persist_job(project_id))? else {
            return Ok(false);
        };
        let limits = self.limits.limits_at(Utc::now());
        let result = self.persister.persist_buffer(project_id, &limits)?;
        debug!(%project_id, persisted = result.number_of_changes_persisted, "persist job done");
        job.close()?;
        Ok(true)
    }

    fn expire_job(&self, project_id: &HistoryId) -> Result<bool> {
        let buffer = self.persister.buffer();
        let Some(job) = claimed(buffer.claim_expire_job(project_id))? else {
            return Ok(false);
        };
        let mut status = buffer.expire_project(project_id)?;
        if status == ExpireStatus::NotPersisted {
            // flush whatever is left regardless of age before dropping it
            let limits = PersistLimits {
                min_change_timestamp: None,
                max_change_timestamp: None,
                ..self.limits.limits_at(Utc::now())
            };
            self.persister.persist_buffer(project_id, &limits)?;
            status = buffer.expire_project(project_id)?;
        }
        match status {
            ExpireStatus::Expired | ExpireStatus::NotFound => {
                job.close()?;
                Ok(true)
            }
            ExpireStatus::NotPersisted => Err(StoreError::Invariant(format!(
                "buffer of project {project_id} still holds unpersisted changes after a full flush"
            ))),
        }
    }
}

/// Treat "nothing to claim" outcomes as a skip.
fn claimed<T>(claim: Result<T>) -> Result<Option<T>> {
    match claim {
        Ok(job) => Ok(Some(job)),
        Err(StoreError::JobNotFound(_) | StoreError::JobNotReady(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::fixture;
    use super::*;
    use crate::buffer::QueueOptions;
    use crate::model::{Change, File, Operation};
    use chrono::Duration;

    fn change(name: &str) -> Change {
        Change::new(vec![Operation::add_file(name, File::from_string("x"))], Utc::now())
    }

    #[test]
    fn test_run_once_persists_and_expires() {
        let f = fixture();
        let persister = Arc::new(f.persister);
        let due = HistoryId::Postgres(21);
        let later = HistoryId::Postgres(22);
        let past = Utc::now() - Duration::seconds(5);

        for project_id in [&due, &later] {
            persister.chunks().initialize_project(project_id).unwrap();
        }
        persister
            .queue_changes(
                &due,
                &[change("a.tex")],
                0,
                QueueOptions {
                    persist_time: Some(past),
                    expire_time: Some(past),
                    ..Default::default()
                },
            )
            .unwrap();
        persister
            .queue_changes(&later, &[change("b.tex")], 0, QueueOptions::default())
            .unwrap();

        let worker = BufferWorker::new(persister.clone(), LimitSettings::default());
        let report = worker.run_once().unwrap();
        assert_eq!(report.persisted, 1);
        assert_eq!(report.expired, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.flushed, vec![due.clone(), due.clone()]);

        let end = |p: &HistoryId| persister.chunks().get_latest_chunk_metadata(p).unwrap().unwrap().end_version;
        assert_eq!(end(&due), 1);
        assert_eq!(end(&later), 0);
        assert_eq!(persister.buffer().get_state(&due).unwrap().head_version, None);
        assert_eq!(persister.buffer().get_state(&later).unwrap().head_version, Some(1));
    }

    #[test]
    fn test_expire_flush_keeps_chunk_limits() {
        let f = fixture();
        let persister = Arc::new(f.persister);
        let project_id = HistoryId::Postgres(24);
        persister.chunks().initialize_project(&project_id).unwrap();
        let changes: Vec<_> = ["a.tex", "b.tex", "c.tex", "d.tex", "e.tex"]
            .iter()
            .map(|name| change(name))
            .collect();
        persister
            .queue_changes(
                &project_id,
                &changes,
                0,
                QueueOptions {
                    persist_time: Some(Utc::now() + Duration::hours(1)),
                    expire_time: Some(Utc::now() - Duration::seconds(1)),
                    ..Default::default()
                },
            )
            .unwrap();

        let limits = LimitSettings {
            max_chunk_changes: 2,
            ..Default::default()
        };
        let report = BufferWorker::new(persister.clone(), limits).run_once().unwrap();
        assert_eq!(report.expired, 1);
        let sizes: Vec<_> = persister
            .chunks()
            .get_project_chunks(&project_id)
            .unwrap()
            .iter()
            .map(|record| record.end_version - record.start_version)
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_expire_flushes_first() {
        let f = fixture();
        let persister = Arc::new(f.persister);
        let project_id = HistoryId::Postgres(23);
        persister.chunks().initialize_project(&project_id).unwrap();
        persister
            .queue_changes(
                &project_id,
                &[change("a.tex")],
                0,
                QueueOptions {
                    expire_time: Some(Utc::now() - Duration::seconds(1)),
                    ..Default::default()
                },
            )
            .unwrap();

        let limits = LimitSettings {
            // the persist job would never flush a change this young
            min_change_age_secs: Some(3600),
            ..Default::default()
        };
        let report = BufferWorker::new(persister.clone(), limits).run_once().unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(
            persister.chunks().get_latest_chunk_metadata(&project_id).unwrap().unwrap().end_version,
            1
        );
    }
}
