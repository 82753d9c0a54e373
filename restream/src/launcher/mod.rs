//! Session launchers.
//!
//! A launcher turns a stream definition into one supervised external
//! process. The scheduler only sees the [`SessionLauncher`] trait and the
//! [`ProcessHandle`] it returns.

mod ffmpeg;
mod traits;

pub use ffmpeg::{FfmpegConfig, FfmpegLauncher};
pub use process_utils::ExitOutcome;
pub use traits::{LaunchError, ProcessHandle, SessionLauncher};
