//! Stream definition entity.
//!
//! A stream definition is the durable description of one outbound push: where
//! the media comes from, which ingest endpoint receives it, and whether it is
//! currently live on this host.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::models::StreamDbModel;
use crate::database::time::{ms_to_datetime, now_ms};
use crate::{Error, Result};

/// Persisted streaming status.
///
/// This is a cache of scheduler registry membership, never the source of
/// truth while a process is live.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    #[default]
    Inactive,
    Active,
}

/// Target streaming platform, used for encoder tuning only.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Tiktok,
    Shopee,
    #[default]
    Other,
}

/// Where the media for a stream comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamSource {
    /// A previously uploaded file on local disk.
    UploadedFile { path: PathBuf },
    /// A network source passed through to the engine uninterpreted.
    LiveCapture { url: String },
}

impl StreamSource {
    /// Database representation of the source kind.
    pub fn type_str(&self) -> &'static str {
        match self {
            StreamSource::UploadedFile { .. } => SOURCE_TYPE_UPLOAD,
            StreamSource::LiveCapture { .. } => SOURCE_TYPE_LIVE_CAPTURE,
        }
    }

    /// The source location as stored in the database.
    pub fn location(&self) -> String {
        match self {
            StreamSource::UploadedFile { path } => path.to_string_lossy().to_string(),
            StreamSource::LiveCapture { url } => url.clone(),
        }
    }

    fn from_parts(source_type: &str, location: &str) -> Result<Self> {
        match source_type {
            SOURCE_TYPE_UPLOAD => Ok(StreamSource::UploadedFile {
                path: PathBuf::from(location),
            }),
            SOURCE_TYPE_LIVE_CAPTURE => Ok(StreamSource::LiveCapture {
                url: location.to_string(),
            }),
            other => Err(Error::validation(format!(
                "Unsupported source type: {}",
                other
            ))),
        }
    }
}

const SOURCE_TYPE_UPLOAD: &str = "upload_video";
const SOURCE_TYPE_LIVE_CAPTURE: &str = "live_capture";

/// RTMP push target.
///
/// The stream key is a secret: `Debug` and `Display` mask it so the
/// destination can be logged safely.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub ingest_base_url: String,
    pub stream_key: String,
}

impl Destination {
    pub fn new(ingest_base_url: impl Into<String>, stream_key: impl Into<String>) -> Self {
        Self {
            ingest_base_url: ingest_base_url.into(),
            stream_key: stream_key.into(),
        }
    }

    /// Full push URL handed to the engine. Never log this.
    pub fn push_url(&self) -> String {
        format!(
            "{}/{}",
            self.ingest_base_url.trim_end_matches('/'),
            self.stream_key
        )
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/****", self.ingest_base_url.trim_end_matches('/'))
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("ingest_base_url", &self.ingest_base_url)
            .field("stream_key", &"****")
            .finish()
    }
}

/// Durable stream definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDefinition {
    pub id: String,
    pub owner_id: String,
    pub platform: Platform,
    pub source: StreamSource,
    pub destination: Destination,
    /// Repeat an uploaded file until terminated. Ignored for live captures.
    pub loop_enabled: bool,
    pub status: StreamStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StreamDefinition {
    /// Create a new inactive definition with a fresh id.
    pub fn new(
        owner_id: impl Into<String>,
        platform: Platform,
        source: StreamSource,
        destination: Destination,
        loop_enabled: bool,
    ) -> Self {
        let now = ms_to_datetime(now_ms());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            platform,
            source,
            destination,
            loop_enabled,
            status: StreamStatus::Inactive,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `user_id` owns this definition.
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }

    /// Whether the engine should repeat the source indefinitely.
    pub fn loops(&self) -> bool {
        self.loop_enabled && matches!(self.source, StreamSource::UploadedFile { .. })
    }

    /// Convert to the database model.
    pub fn to_db_model(&self) -> StreamDbModel {
        StreamDbModel {
            id: self.id.clone(),
            user_id: self.owner_id.clone(),
            platform: self.platform.as_ref().to_string(),
            stream_url: self.destination.ingest_base_url.clone(),
            stream_key: self.destination.stream_key.clone(),
            source_type: self.source.type_str().to_string(),
            source_url: self.source.location(),
            loop_enabled: self.loop_enabled,
            status: self.status.as_ref().to_string(),
            created_at: self.created_at.timestamp_millis(),
            updated_at: self.updated_at.timestamp_millis(),
        }
    }
}

impl TryFrom<StreamDbModel> for StreamDefinition {
    type Error = Error;

    fn try_from(model: StreamDbModel) -> Result<Self> {
        let source = StreamSource::from_parts(&model.source_type, &model.source_url)?;
        let platform = model.platform.parse().unwrap_or_default();
        let status = model.status.parse().map_err(|_| {
            Error::validation(format!("Unknown stream status: {}", model.status))
        })?;

        Ok(Self {
            id: model.id,
            owner_id: model.user_id,
            platform,
            source,
            destination: Destination::new(model.stream_url, model.stream_key),
            loop_enabled: model.loop_enabled,
            status,
            created_at: ms_to_datetime(model.created_at),
            updated_at: ms_to_datetime(model.updated_at),
        })
    }
}

/// Partial change to a stream definition. `None` keeps the current value.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct StreamUpdate {
    pub platform: Option<Platform>,
    pub ingest_base_url: Option<String>,
    pub stream_key: Option<String>,
    pub source: Option<StreamSource>,
    pub loop_enabled: Option<bool>,
}

impl StreamUpdate {
    /// Apply the change and bump `updated_at`. Status is never touched.
    pub fn apply_to(self, definition: &mut StreamDefinition) {
        if let Some(platform) = self.platform {
            definition.platform = platform;
        }
        if let Some(url) = self.ingest_base_url {
            definition.destination.ingest_base_url = url;
        }
        if let Some(key) = self.stream_key {
            definition.destination.stream_key = key;
        }
        if let Some(source) = self.source {
            definition.source = source;
        }
        if let Some(loop_enabled) = self.loop_enabled {
            definition.loop_enabled = loop_enabled;
        }
        definition.updated_at = ms_to_datetime(now_ms());
    }
}

impl fmt::Debug for StreamUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamUpdate")
            .field("platform", &self.platform)
            .field("ingest_base_url", &self.ingest_base_url)
            .field("stream_key", &self.stream_key.as_ref().map(|_| "****"))
            .field("source", &self.source)
            .field("loop_enabled", &self.loop_enabled)
            .finish()
    }
}
