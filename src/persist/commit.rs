//! Commit dispatch by buffer level.

use super::{PersistLimits, PersistResult, Persister};
use crate::buffer::{PersistedVersionStatus, QueueOptions, QueueStatus};
use crate::error::{Result, StoreError};
use crate::model::Change;
use crate::types::HistoryId;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// How a commit trades latency for durability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum BufferLevel {
    /// Persist straight into the chunk store.
    #[default]
    Direct,
    /// Mirror into the buffer only when the project is already buffered,
    /// then persist directly.
    QueueIfExists,
    /// Queue, check the buffer against the committed changes, then persist
    /// directly.
    QueueAndVerify,
    /// Queue, then drain the buffer immediately.
    QueueAndDrain,
    /// Queue only. The background worker drains later.
    QueueOnly,
}

impl BufferLevel {
    pub fn writes_buffer(self) -> bool {
        self != BufferLevel::Direct
    }

    pub fn persists_directly(self) -> bool {
        matches!(
            self,
            BufferLevel::Direct | BufferLevel::QueueIfExists | BufferLevel::QueueAndVerify
        )
    }

    pub fn drains_buffer(self) -> bool {
        self == BufferLevel::QueueAndDrain
    }
}

impl TryFrom<u8> for BufferLevel {
    type Error = StoreError;

    fn try_from(level: u8) -> Result<Self> {
        match level {
            0 => Ok(BufferLevel::Direct),
            1 => Ok(BufferLevel::QueueIfExists),
            2 => Ok(BufferLevel::QueueAndVerify),
            3 => Ok(BufferLevel::QueueAndDrain),
            4 => Ok(BufferLevel::QueueOnly),
            other => Err(StoreError::Config(format!("unknown history buffer level {other}"))),
        }
    }
}

impl From<BufferLevel> for u8 {
    fn from(level: BufferLevel) -> u8 {
        level as u8
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CommitOptions {
    pub level: BufferLevel,
    /// Drain and expire the buffer before committing.
    pub force_persist_buffer: bool,
}

#[derive(Clone, Debug, Default)]
pub struct CommitResult {
    /// Set when the changes went through the buffer.
    pub queue_status: Option<QueueStatus>,
    /// Set when a flush happened as part of the commit.
    pub persist_result: Option<PersistResult>,
}

impl Persister {
    /// Commit `changes` on top of `end_version` using the strategy of
    /// `opts.level`.
    pub fn commit_changes(
        &self,
        project_id: &HistoryId,
        changes: Vec<Change>,
        limits: &PersistLimits,
        end_version: u64,
        opts: CommitOptions,
    ) -> Result<CommitResult> {
        if opts.force_persist_buffer {
            self.persist_buffer(project_id, limits)?;
            let status = self.buffer.expire_project(project_id)?;
            debug!(%project_id, ?status, "forced buffer flush before commit");
        }

        let level = opts.level;
        let mut result = CommitResult::default();
        if level.writes_buffer() {
            let queue_opts = QueueOptions {
                only_if_exists: level == BufferLevel::QueueIfExists,
                ..Default::default()
            };
            let status = self.queue_changes(project_id, &changes, end_version, queue_opts)?;
            if level == BufferLevel::QueueAndVerify {
                self.verify_buffered_changes(project_id, &changes, end_version)?;
            }
            result.queue_status = Some(status);
        }

        if level.persists_directly() {
            let count = changes.len() as u64;
            result.persist_result = self.persist_changes(project_id, changes, limits, end_version)?;
            if let (Some(QueueStatus::Ok), Some(persisted)) = (result.queue_status, &result.persist_result) {
                self.mark_buffered_persisted(project_id, persisted.current_chunk.end_version(), end_version + count)?;
            }
        } else if level.drains_buffer() {
            result.persist_result = Some(self.persist_buffer(project_id, limits)?);
        }
        debug!(%project_id, ?level, end_version, "committed changes");
        Ok(result)
    }

    /// Compare what the buffer holds after `end_version` with what is being
    /// committed. Differences are logged, never fatal.
    fn verify_buffered_changes(&self, project_id: &HistoryId, changes: &[Change], end_version: u64) -> Result<()> {
        let buffered = self.buffer.get_non_persisted_changes(project_id, end_version, None)?;
        let expected = changes.iter().map(Change::to_json).collect::<Result<Vec<_>>>()?;
        let actual = buffered.iter().map(Change::to_json).collect::<Result<Vec<_>>>()?;
        if expected != actual {
            warn!(
                %project_id,
                end_version,
                expected = expected.len(),
                buffered = actual.len(),
                "buffered changes differ from committed changes"
            );
        }
        Ok(())
    }

    /// Record a direct flush in the buffer so the mirrored changes are not
    /// persisted a second time.
    fn mark_buffered_persisted(&self, project_id: &HistoryId, persisted: u64, head: u64) -> Result<()> {
        if persisted != head {
            return Ok(());
        }
        let status = self.buffer.set_persisted_version(project_id, persisted)?;
        if status != PersistedVersionStatus::Ok {
            return Err(StoreError::Invariant(format!(
                "buffer of project {project_id} refused persisted version {persisted}: {status:?}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::fixture;
    use super::*;
    use crate::model::{File, Operation};
    use chrono::Utc;

    fn project() -> HistoryId {
        HistoryId::Postgres(11)
    }

    fn adds(range: std::ops::Range<usize>) -> Vec<Change> {
        range
            .map(|i| Change::new(vec![Operation::add_file(format!("f{i}.tex"), File::from_string("x"))], Utc::now()))
            .collect()
    }

    fn commit(level: u8, f: &super::super::testing::Fixture, changes: Vec<Change>, end: u64) -> CommitResult {
        let opts = CommitOptions {
            level: BufferLevel::try_from(level).unwrap(),
            force_persist_buffer: false,
        };
        f.persister
            .commit_changes(&project(), changes, &PersistLimits::default(), end, opts)
            .unwrap()
    }

    fn persisted_end(f: &super::super::testing::Fixture) -> u64 {
        f.persister
            .chunks()
            .get_latest_chunk_metadata(&project())
            .unwrap()
            .unwrap()
            .end_version
    }

    #[test]
    fn test_level_conversion() {
        assert_eq!(u8::from(BufferLevel::QueueOnly), 4);
        assert!(BufferLevel::try_from(5).is_err());
        assert!(!BufferLevel::Direct.writes_buffer());
        assert!(BufferLevel::QueueIfExists.persists_directly());
        assert!(BufferLevel::QueueAndDrain.drains_buffer());
        assert!(!BufferLevel::QueueOnly.persists_directly());
    }

    #[test]
    fn test_level_0_bypasses_buffer() {
        let f = fixture();
        f.persister.chunks().initialize_project(&project()).unwrap();
        let result = commit(0, &f, adds(0..2), 0);
        assert_eq!(result.queue_status, None);
        assert_eq!(persisted_end(&f), 2);
        assert!(f.persister.buffer().get_head_snapshot(&project()).unwrap().is_none());
    }

    #[test]
    fn test_level_1_only_mirrors_existing_buffer() {
        let f = fixture();
        f.persister.chunks().initialize_project(&project()).unwrap();
        let result = commit(1, &f, adds(0..1), 0);
        assert_eq!(result.queue_status, Some(QueueStatus::Ignore));
        assert_eq!(persisted_end(&f), 1);
        assert!(f.persister.buffer().get_head_snapshot(&project()).unwrap().is_none());
    }

    #[test]
    fn test_level_2_queues_and_persists() {
        let f = fixture();
        f.persister.chunks().initialize_project(&project()).unwrap();
        let result = commit(2, &f, adds(0..3), 0);
        assert_eq!(result.queue_status, Some(QueueStatus::Ok));
        assert_eq!(persisted_end(&f), 3);
        let state = f.persister.buffer().get_state(&project()).unwrap();
        assert_eq!(state.head_version, Some(3));
        assert_eq!(state.persisted_version, Some(3));

        // the next level 1 commit now mirrors into the buffer
        let result = commit(1, &f, adds(3..4), 3);
        assert_eq!(result.queue_status, Some(QueueStatus::Ok));
        assert_eq!(f.persister.buffer().get_state(&project()).unwrap().persisted_version, Some(4));
    }

    #[test]
    fn test_refused_buffer_marker_is_an_error() {
        let f = fixture();
        f.persister.chunks().initialize_project(&project()).unwrap();
        commit(2, &f, adds(0..3), 0);

        // buffer already records 3 as persisted
        let err = f.persister.mark_buffered_persisted(&project(), 2, 2).unwrap_err();
        assert!(matches!(err, StoreError::Invariant(_)), "unexpected error: {err}");
        assert_eq!(f.persister.buffer().get_state(&project()).unwrap().persisted_version, Some(3));

        // no buffer at all
        let other = HistoryId::Postgres(12);
        let err = f.persister.mark_buffered_persisted(&other, 1, 1).unwrap_err();
        assert!(matches!(err, StoreError::Invariant(_)), "unexpected error: {err}");

        // a partial flush leaves the marker alone
        f.persister.mark_buffered_persisted(&project(), 2, 3).unwrap();
    }

    #[test]
    fn test_level_3_drains_immediately() {
        let f = fixture();
        f.persister.chunks().initialize_project(&project()).unwrap();
        let result = commit(3, &f, adds(0..2), 0);
        assert_eq!(result.persist_result.unwrap().number_of_changes_persisted, 2);
        assert_eq!(persisted_end(&f), 2);
    }

    #[test]
    fn test_level_4_defers_and_force_flushes() {
        let f = fixture();
        f.persister.chunks().initialize_project(&project()).unwrap();
        let result = commit(4, &f, adds(0..2), 0);
        assert!(result.persist_result.is_none());
        assert_eq!(persisted_end(&f), 0);
        assert_eq!(
            f.persister.chunks().load_latest(&project(), false).unwrap().end_version(),
            2
        );

        let opts = CommitOptions {
            level: BufferLevel::Direct,
            force_persist_buffer: true,
        };
        f.persister
            .commit_changes(&project(), adds(2..3), &PersistLimits::default(), 2, opts)
            .unwrap();
        assert_eq!(persisted_end(&f), 3);
        assert_eq!(f.persister.buffer().get_state(&project()).unwrap().head_version, None);
    }
}
