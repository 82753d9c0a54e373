//! restream library crate.
//!
//! Re-streams uploaded files and live captures to RTMP ingest endpoints,
//! bounding how many ffmpeg sessions run at once on this host.

pub mod api;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod launcher;
pub mod logging;
pub mod scheduler;

pub use error::{Error, Result};
