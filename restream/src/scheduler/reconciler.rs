//! Persists session status transitions to the record store.
//!
//! The reconciler never decides anything: the registry is the authority and
//! the persisted `status` is a cache of it. Errors are handed back to the
//! scheduler, which logs them and moves on.

use std::sync::Arc;

use tracing::debug;

use crate::Result;
use crate::database::repositories::StreamRepository;
use crate::domain::StreamStatus;

pub struct StatusReconciler {
    repo: Arc<dyn StreamRepository>,
}

impl StatusReconciler {
    pub fn new(repo: Arc<dyn StreamRepository>) -> Self {
        Self { repo }
    }

    /// `inactive → active`, on admission.
    pub async fn mark_active(&self, stream_id: &str) -> Result<()> {
        self.persist(stream_id, StreamStatus::Active).await
    }

    /// `active → inactive`, on process exit.
    pub async fn mark_inactive(&self, stream_id: &str) -> Result<()> {
        self.persist(stream_id, StreamStatus::Inactive).await
    }

    /// Clear statuses left `active` by a previous run. Nothing survives a
    /// restart, so every persisted `active` is stale at startup.
    pub async fn reset_stale(&self) -> Result<u64> {
        let reset = self.repo.reset_all_status().await?;
        if reset > 0 {
            debug!(count = reset, "Reset stale active stream statuses");
        }
        Ok(reset)
    }

    async fn persist(&self, stream_id: &str, status: StreamStatus) -> Result<()> {
        self.repo.update_status(stream_id, status).await?;
        debug!(stream_id = %stream_id, status = %status, "Persisted stream status");
        Ok(())
    }
}
