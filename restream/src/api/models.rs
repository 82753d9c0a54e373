//! API request and response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    Destination, Platform, StreamDefinition, StreamSource, StreamStatus, StreamUpdate,
};

/// Request body for creating a stream definition.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateStreamRequest {
    #[serde(default)]
    pub platform: Platform,
    /// RTMP ingest base URL, e.g. `rtmp://a.rtmp.youtube.com/live2`.
    pub stream_url: String,
    pub stream_key: String,
    pub source: StreamSource,
    #[serde(default)]
    pub loop_enabled: bool,
}

impl CreateStreamRequest {
    /// Check the request, returning a message describing the first problem.
    pub fn validate(&self) -> Result<(), String> {
        let url = self.stream_url.trim();
        if url.is_empty() {
            return Err("stream_url cannot be empty".to_string());
        }
        if !is_rtmp_url(url) {
            return Err("stream_url must be an rtmp:// or rtmps:// URL".to_string());
        }
        if self.stream_key.trim().is_empty() {
            return Err("stream_key cannot be empty".to_string());
        }
        if self.source.location().trim().is_empty() {
            return Err("source location cannot be empty".to_string());
        }
        Ok(())
    }

    pub fn into_definition(self, owner_id: &str) -> StreamDefinition {
        StreamDefinition::new(
            owner_id,
            self.platform,
            self.source,
            Destination::new(self.stream_url.trim(), self.stream_key.trim()),
            self.loop_enabled,
        )
    }
}

fn is_rtmp_url(url: &str) -> bool {
    url.starts_with("rtmp://") || url.starts_with("rtmps://")
}

/// Request body for a partial update. Absent or blank fields keep their
/// current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateStreamRequest {
    pub platform: Option<Platform>,
    pub stream_url: Option<String>,
    pub stream_key: Option<String>,
    pub source: Option<StreamSource>,
    pub loop_enabled: Option<bool>,
}

impl UpdateStreamRequest {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(url) = non_blank(&self.stream_url) {
            if !is_rtmp_url(url) {
                return Err("stream_url must be an rtmp:// or rtmps:// URL".to_string());
            }
        }
        if let Some(source) = &self.source {
            if source.location().trim().is_empty() {
                return Err("source location cannot be empty".to_string());
            }
        }
        Ok(())
    }

    pub fn into_update(self) -> StreamUpdate {
        StreamUpdate {
            platform: self.platform,
            ingest_base_url: non_blank(&self.stream_url).map(str::to_string),
            stream_key: non_blank(&self.stream_key).map(str::to_string),
            source: self.source,
            loop_enabled: self.loop_enabled,
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Stream definition as returned by the API. The stream key is masked.
#[derive(Debug, Clone, Serialize)]
pub struct StreamResponse {
    pub id: String,
    pub platform: Platform,
    pub source: StreamSource,
    /// Push target with the key masked.
    pub destination: String,
    pub loop_enabled: bool,
    pub status: StreamStatus,
    /// Whether a session is registered on this host right now.
    pub running: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StreamResponse {
    pub fn from_definition(definition: &StreamDefinition, running: bool) -> Self {
        Self {
            id: definition.id.clone(),
            platform: definition.platform,
            source: definition.source.clone(),
            destination: definition.destination.to_string(),
            loop_enabled: definition.loop_enabled,
            status: definition.status,
            running,
            created_at: definition.created_at,
            updated_at: definition.updated_at,
        }
    }
}

/// Health response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub active_sessions: usize,
    pub queued_streams: usize,
    pub max_concurrent: usize,
}

/// Request to update the log filter.
#[derive(Debug, Deserialize)]
pub struct UpdateLogFilterRequest {
    pub filter: String,
}

/// Current logging configuration.
#[derive(Debug, Serialize)]
pub struct LoggingConfigResponse {
    pub filter: String,
    pub available_modules: Vec<ModuleInfo>,
}

#[derive(Debug, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    pub description: String,
}
