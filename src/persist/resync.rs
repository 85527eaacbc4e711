//! Out-of-band resync requests to the project history service.

use crate::error::{Result, StoreError};
use crate::types::HistoryId;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{info, warn};

/// Asks for a project's history to be regenerated from its source of truth.
pub trait ResyncRequester: Send + Sync {
    fn request_resync(&self, project_id: &HistoryId) -> Result<()>;
}

/// POSTs to `{base}/project/{id}/resync`.
///
/// Transport failures are returned; an error status from the service is
/// only logged.
pub struct HttpResyncClient {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpResyncClient {
    pub fn new(base_url: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(Duration::from_secs(30))
            .build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
        }
    }

    fn url(&self, project_id: &HistoryId) -> String {
        format!("{}/project/{project_id}/resync", self.base_url)
    }
}

impl ResyncRequester for HttpResyncClient {
    fn request_resync(&self, project_id: &HistoryId) -> Result<()> {
        match self
            .agent
            .post(&self.url(project_id))
            .send_json(serde_json::json!({ "origin": { "kind": "history-v1" } }))
        {
            Ok(_) => {
                info!(%project_id, "requested resync");
                Ok(())
            }
            Err(ureq::Error::Status(code, _)) => {
                warn!(%project_id, status = code, "resync request rejected");
                Ok(())
            }
            Err(ureq::Error::Transport(e)) => Err(StoreError::Http(format!("resync {project_id}: {e}"))),
        }
    }
}

/// Used when no resync endpoint is configured.
pub struct NoResync;

impl ResyncRequester for NoResync {
    fn request_resync(&self, project_id: &HistoryId) -> Result<()> {
        warn!(%project_id, "resync needed but no resync endpoint is configured");
        Ok(())
    }
}

/// Records requests instead of sending them.
#[derive(Default)]
pub struct RecordingResync {
    requests: Mutex<Vec<HistoryId>>,
}

impl RecordingResync {
    pub fn requests(&self) -> Vec<HistoryId> {
        self.requests.lock().clone()
    }
}

impl ResyncRequester for RecordingResync {
    fn request_resync(&self, project_id: &HistoryId) -> Result<()> {
        self.requests.lock().push(project_id.clone());
        Ok(())
    }
}
