//! Stream database model.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Row in the `streams` table.
#[derive(Clone, FromRow, Serialize, Deserialize)]
pub struct StreamDbModel {
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// youtube, tiktok, shopee or other.
    pub platform: String,
    /// Ingest base URL.
    pub stream_url: String,
    /// Secret appended to the ingest URL.
    pub stream_key: String,
    /// upload_video or live_capture.
    pub source_type: String,
    /// File path or capture URL depending on `source_type`.
    pub source_url: String,
    pub loop_enabled: bool,
    /// inactive or active.
    pub status: String,
    /// Unix epoch milliseconds (UTC) when created.
    pub created_at: i64,
    /// Unix epoch milliseconds (UTC) when last updated.
    pub updated_at: i64,
}

impl fmt::Debug for StreamDbModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamDbModel")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("platform", &self.platform)
            .field("stream_url", &self.stream_url)
            .field("stream_key", &"****")
            .field("source_type", &self.source_type)
            .field("source_url", &self.source_url)
            .field("loop_enabled", &self.loop_enabled)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}
