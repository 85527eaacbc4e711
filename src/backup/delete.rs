use super::{BackupService, SoftDeletion};
use crate::error::{Result, StoreError};
use crate::types::HistoryId;
use chrono::{DateTime, Duration, Utc};
use tracing::info;

impl BackupService {
    /// Record that the owner deleted a project. Its backup becomes
    /// deletable once the grace period has passed.
    pub fn record_soft_deletion(
        &self,
        project_id: &str,
        history_id: Option<HistoryId>,
        deleted_at: DateTime<Utc>,
    ) -> Result<()> {
        self.status.record_soft_deletion(SoftDeletion {
            project_id: project_id.to_string(),
            history_id,
            deleted_at,
        })
    }

    /// Remove the whole backup of a soft-deleted project.
    ///
    /// Refuses with [`StoreError::NotReadyToDelete`] unless the project was
    /// soft-deleted longer ago than the grace period, its history id is
    /// known, and its history holds no chunks any more.
    pub fn delete_project_backup(&self, project_id: &str) -> Result<()> {
        let not_ready = |reason: &str| StoreError::NotReadyToDelete {
            project_id: project_id.to_string(),
            reason: reason.to_string(),
        };
        let deletion = self
            .status
            .soft_deletion(project_id)?
            .ok_or_else(|| not_ready("project is not soft-deleted"))?;
        let grace = Duration::days(self.settings.deletion_grace_days);
        if Utc::now() - deletion.deleted_at < grace {
            return Err(not_ready("soft-deletion grace period has not passed"));
        }
        let history_id = deletion
            .history_id
            .ok_or_else(|| not_ready("history id is unknown"))?;
        if self.chunks.get_latest_chunk_metadata(&history_id)?.is_some() {
            return Err(not_ready("history still has chunks"));
        }

        self.persistor.delete_project(&history_id)?;
        self.status.delete_project(&history_id)?;
        info!(project_id, %history_id, "deleted backup of soft-deleted project");
        Ok(())
    }
}
