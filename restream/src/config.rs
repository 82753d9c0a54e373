//! Process-wide configuration loaded from the environment.
//!
//! Values are read once at startup (after `.env` has been applied by
//! `dotenvy`). The concurrency cap in particular is fixed for the lifetime of
//! the process.

use std::str::FromStr;
use std::time::Duration;

use crate::launcher::FfmpegConfig;
use crate::{Error, Result};

/// Default number of simultaneous outbound streams.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: usize = 2;

/// Default SQLite database location.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:restream.db?mode=rwc";

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite database URL.
    pub database_url: String,
    /// Maximum number of sessions running at once on this host.
    pub max_concurrent_streams: usize,
    /// API bind address.
    pub bind_address: String,
    /// API port.
    pub port: u16,
    /// Directory for rolling log files.
    pub log_dir: String,
    /// How long shutdown waits for running sessions to exit.
    pub shutdown_timeout: Duration,
    /// ffmpeg launcher tuning.
    pub ffmpeg: FfmpegConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            bind_address: "0.0.0.0".to_string(),
            port: 12556,
            log_dir: "logs".to_string(),
            shutdown_timeout: Duration::from_secs(10),
            ffmpeg: FfmpegConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `DATABASE_URL`
    /// - `MAX_CONCURRENT_STREAMS` (>= 1)
    /// - `FFMPEG_PATH`
    /// - `API_BIND_ADDRESS`, `API_PORT`
    /// - `LOG_DIR`
    /// - `SHUTDOWN_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(value) = get("MAX_CONCURRENT_STREAMS") {
            config.max_concurrent_streams = parse_var("MAX_CONCURRENT_STREAMS", &value)?;
        }
        if let Some(path) = get("FFMPEG_PATH") {
            config.ffmpeg.binary_path = path;
        }
        if let Some(address) = get("API_BIND_ADDRESS") {
            config.bind_address = address;
        }
        if let Some(value) = get("API_PORT") {
            config.port = parse_var("API_PORT", &value)?;
        }
        if let Some(dir) = get("LOG_DIR") {
            config.log_dir = dir;
        }
        if let Some(value) = get("SHUTDOWN_TIMEOUT_SECS") {
            config.shutdown_timeout = Duration::from_secs(parse_var("SHUTDOWN_TIMEOUT_SECS", &value)?);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent_streams == 0 {
            return Err(Error::config("MAX_CONCURRENT_STREAMS must be at least 1"));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("Invalid value for {}: '{}'", key, value)))
}
