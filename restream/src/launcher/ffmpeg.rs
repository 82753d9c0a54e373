//! ffmpeg session launcher.

use std::process::Stdio;

use async_trait::async_trait;
use process_utils::{tokio_command, watch_child};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::traits::{LaunchError, ProcessHandle, SessionLauncher};
use crate::domain::{Destination, Platform, StreamDefinition, StreamSource};

/// Encoder tuning for outbound streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfmpegConfig {
    /// Path to the ffmpeg binary.
    pub binary_path: String,
    /// x264 preset.
    pub preset: String,
    /// Default video bitrate.
    pub video_bitrate: String,
    /// Video bitrate used for YouTube ingest.
    pub youtube_video_bitrate: String,
    /// Default rate-control buffer size.
    pub buffer_size: String,
    /// Keyframe interval in frames.
    pub gop_size: u32,
    pub audio_bitrate: String,
    pub audio_sample_rate: u32,
    /// Scale filter applied for vertical platforms (TikTok).
    pub vertical_scale: String,
    /// Extra arguments placed before the input.
    pub input_args: Vec<String>,
    /// Extra arguments placed before the output.
    pub output_args: Vec<String>,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
            preset: "veryfast".to_string(),
            video_bitrate: "2500k".to_string(),
            youtube_video_bitrate: "4000k".to_string(),
            buffer_size: "5000k".to_string(),
            gop_size: 60,
            audio_bitrate: "128k".to_string(),
            audio_sample_rate: 44100,
            vertical_scale: "720:1280".to_string(),
            input_args: Vec::new(),
            output_args: Vec::new(),
        }
    }
}

/// Launches one ffmpeg process per session, pushing FLV to the ingest URL.
pub struct FfmpegLauncher {
    config: FfmpegConfig,
    /// Cached version string.
    version: Option<String>,
}

impl FfmpegLauncher {
    /// Create a launcher with default tuning.
    pub fn new() -> Self {
        Self::with_config(FfmpegConfig::default())
    }

    /// Create a launcher with custom tuning.
    pub fn with_config(config: FfmpegConfig) -> Self {
        let version = Self::detect_version(&config.binary_path);
        Self { config, version }
    }

    /// Detect ffmpeg version.
    fn detect_version(path: &str) -> Option<String> {
        std::process::Command::new(path)
            .arg("-version")
            .output()
            .ok()
            .filter(|output| output.status.success())
            .and_then(|output| {
                String::from_utf8(output.stdout)
                    .ok()
                    .and_then(|s| s.lines().next().map(|l| l.to_string()))
            })
    }

    pub fn is_available(&self) -> bool {
        self.version.is_some()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn config(&self) -> &FfmpegConfig {
        &self.config
    }

    /// Build ffmpeg command arguments. The last argument is the push URL.
    fn build_args(&self, definition: &StreamDefinition) -> Vec<String> {
        let config = &self.config;
        let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-loglevel", "level+warning"]
            .into_iter()
            .map(String::from)
            .collect();

        args.extend(config.input_args.iter().cloned());

        match &definition.source {
            StreamSource::UploadedFile { path } => {
                // Read files at native frame rate so the ingest sees real time.
                args.push("-re".to_string());
                if definition.loops() {
                    args.extend(["-stream_loop".to_string(), "-1".to_string()]);
                }
                args.extend(["-i".to_string(), path.to_string_lossy().to_string()]);
            }
            StreamSource::LiveCapture { url } => {
                args.extend(["-i".to_string(), url.clone()]);
            }
        }

        args.extend([
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            config.preset.clone(),
        ]);

        if definition.platform == Platform::Tiktok {
            args.extend(["-vf".to_string(), format!("scale={}", config.vertical_scale)]);
        }

        let (bitrate, bufsize) = match definition.platform {
            Platform::Youtube => (
                config.youtube_video_bitrate.clone(),
                double_rate(&config.youtube_video_bitrate)
                    .unwrap_or_else(|| config.buffer_size.clone()),
            ),
            _ => (config.video_bitrate.clone(), config.buffer_size.clone()),
        };

        args.extend([
            "-b:v".to_string(),
            bitrate.clone(),
            "-maxrate".to_string(),
            bitrate,
            "-bufsize".to_string(),
            bufsize,
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-g".to_string(),
            config.gop_size.to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            config.audio_bitrate.clone(),
            "-ar".to_string(),
            config.audio_sample_rate.to_string(),
        ]);

        args.extend(config.output_args.iter().cloned());

        args.extend([
            "-f".to_string(),
            "flv".to_string(),
            definition.destination.push_url(),
        ]);

        args
    }

    /// Arguments safe to log: the push URL is replaced by the masked destination.
    fn redacted_args(args: &[String], definition: &StreamDefinition) -> Vec<String> {
        let mut redacted = args.to_vec();
        if let Some(last) = redacted.last_mut() {
            *last = definition.destination.to_string();
        }
        redacted
    }

    async fn check_source(definition: &StreamDefinition) -> Result<(), LaunchError> {
        if let StreamSource::UploadedFile { path } = &definition.source {
            let readable = match tokio::fs::metadata(path).await {
                Ok(meta) if meta.is_file() => tokio::fs::File::open(path).await.is_ok(),
                _ => false,
            };
            if !readable {
                return Err(LaunchError::SourceUnavailable { path: path.clone() });
            }
        }
        Ok(())
    }
}

impl Default for FfmpegLauncher {
    fn default() -> Self {
        Self::new()
    }
}

/// Double a bitrate string such as `4000k`.
fn double_rate(rate: &str) -> Option<String> {
    let split = rate
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rate.len());
    let (number, unit) = rate.split_at(split);
    number
        .parse::<u64>()
        .ok()
        .map(|n| format!("{}{}", n * 2, unit))
}

/// Replace the push URL and the bare stream key in `line` with their masked
/// forms.
fn redact_line(line: &str, destination: &Destination) -> String {
    let masked = destination.to_string();
    let mut redacted = line.replace(&destination.push_url(), &masked);
    if !destination.stream_key.is_empty() {
        redacted = redacted.replace(&destination.stream_key, "****");
    }
    redacted
}

/// Whether a stderr line is an error. With `-loglevel level+...` ffmpeg tags
/// each line with its level, after any `[component @ 0x..]` prefix.
fn is_error_line(line: &str) -> bool {
    line.contains("[error] ")
        || line.contains("[fatal] ")
        || line.trim_start().starts_with("Error ")
}

#[async_trait]
impl SessionLauncher for FfmpegLauncher {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn launch(&self, definition: &StreamDefinition) -> Result<ProcessHandle, LaunchError> {
        Self::check_source(definition).await?;

        let args = self.build_args(definition);
        info!(
            stream_id = %definition.id,
            "Starting ffmpeg with args: {:?}",
            Self::redacted_args(&args, definition)
        );

        let mut child = tokio_command(&self.config.binary_path)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| LaunchError::LaunchFailed(format!("Failed to spawn ffmpeg: {}", e)))?;

        let pid = child.id();

        if let Some(stderr) = child.stderr.take() {
            let stream_id = definition.id.clone();
            let destination = definition.destination.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            // ffmpeg echoes the output URL in connection errors.
                            let line = redact_line(&line, &destination);
                            if is_error_line(&line) {
                                warn!(stream_id = %stream_id, "ffmpeg: {}", line);
                            } else {
                                debug!(stream_id = %stream_id, "ffmpeg: {}", line);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(stream_id = %stream_id, "Stopped reading ffmpeg output: {}", e);
                            break;
                        }
                    }
                }
            });
        }

        let cancellation_token = CancellationToken::new();
        let exit_rx = watch_child(child, cancellation_token.clone());

        Ok(ProcessHandle::new(pid, cancellation_token, exit_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Destination;
    use std::path::PathBuf;

    fn launcher(binary: &str) -> FfmpegLauncher {
        FfmpegLauncher::with_config(FfmpegConfig {
            binary_path: binary.to_string(),
            ..FfmpegConfig::default()
        })
    }

    fn definition(platform: Platform, source: StreamSource, loop_enabled: bool) -> StreamDefinition {
        StreamDefinition::new(
            "user-1",
            platform,
            source,
            Destination::new("rtmp://ingest.example.com/live", "key-123"),
            loop_enabled,
        )
    }

    fn upload(path: &str) -> StreamSource {
        StreamSource::UploadedFile {
            path: PathBuf::from(path),
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(|s| s.as_str())
    }

    #[test]
    fn test_upload_args_read_at_native_rate() {
        let def = definition(Platform::Other, upload("/videos/a.mp4"), false);
        let args = launcher("ffmpeg").build_args(&def);

        assert!(args.contains(&"-re".to_string()));
        assert!(!args.contains(&"-stream_loop".to_string()));
        assert_eq!(value_after(&args, "-i"), Some("/videos/a.mp4"));
        assert_eq!(value_after(&args, "-b:v"), Some("2500k"));
        assert_eq!(value_after(&args, "-f"), Some("flv"));
        assert_eq!(
            args.last().map(|s| s.as_str()),
            Some("rtmp://ingest.example.com/live/key-123")
        );
    }

    #[test]
    fn test_loop_flag_precedes_input() {
        let def = definition(Platform::Other, upload("/videos/a.mp4"), true);
        let args = launcher("ffmpeg").build_args(&def);

        let loop_pos = args.iter().position(|a| a == "-stream_loop").unwrap();
        let input_pos = args.iter().position(|a| a == "-i").unwrap();
        assert!(loop_pos < input_pos);
        assert_eq!(value_after(&args, "-stream_loop"), Some("-1"));
    }

    #[test]
    fn test_live_capture_ignores_loop() {
        let source = StreamSource::LiveCapture {
            url: "rtmp://origin/live/cam".to_string(),
        };
        let def = definition(Platform::Other, source, true);
        let args = launcher("ffmpeg").build_args(&def);

        assert!(!args.contains(&"-re".to_string()));
        assert!(!args.contains(&"-stream_loop".to_string()));
        assert_eq!(value_after(&args, "-i"), Some("rtmp://origin/live/cam"));
    }

    #[test]
    fn test_platform_tuning() {
        let youtube = launcher("ffmpeg").build_args(&definition(
            Platform::Youtube,
            upload("/v.mp4"),
            false,
        ));
        assert_eq!(value_after(&youtube, "-b:v"), Some("4000k"));
        assert_eq!(value_after(&youtube, "-bufsize"), Some("8000k"));
        assert!(!youtube.contains(&"-vf".to_string()));

        let tiktok = launcher("ffmpeg").build_args(&definition(
            Platform::Tiktok,
            upload("/v.mp4"),
            false,
        ));
        assert_eq!(value_after(&tiktok, "-vf"), Some("scale=720:1280"));
        assert_eq!(value_after(&tiktok, "-b:v"), Some("2500k"));
    }

    #[test]
    fn test_redacted_args_hide_stream_key() {
        let def = definition(Platform::Other, upload("/v.mp4"), false);
        let args = launcher("ffmpeg").build_args(&def);
        let redacted = FfmpegLauncher::redacted_args(&args, &def);

        assert!(!redacted.iter().any(|a| a.contains("key-123")));
        assert_eq!(redacted.len(), args.len());
    }

    #[test]
    fn test_redact_line_masks_push_url_and_key() {
        let destination = Destination::new("rtmp://ingest.example.com/live/", "key-123");

        let line = redact_line(
            "rtmp://ingest.example.com/live/key-123: Input/output error",
            &destination,
        );
        assert_eq!(line, "rtmp://ingest.example.com/live/****: Input/output error");

        let line = redact_line("[flv @ 0x55d] Failed to update header with key-123", &destination);
        assert!(!line.contains("key-123"));

        let untouched = "frame=  120 fps= 30 q=23.0 size=     512kB";
        assert_eq!(redact_line(untouched, &destination), untouched);
    }

    #[test]
    fn test_is_error_line() {
        assert!(is_error_line("[out#0/flv @ 0x5581] [error] Error opening output files"));
        assert!(is_error_line("[fatal] Conversion failed!"));
        assert!(is_error_line("Error opening input: No such file or directory"));

        assert!(!is_error_line("[warning] Past duration 0.999 too large"));
        assert!(!is_error_line("[info] error concealment enabled"));
        assert!(!is_error_line("[h264 @ 0x55d] [warning] concealing 12 errors in frame"));
    }

    #[test]
    fn test_double_rate() {
        assert_eq!(double_rate("4000k").as_deref(), Some("8000k"));
        assert_eq!(double_rate("3M").as_deref(), Some("6M"));
        assert_eq!(double_rate("fast"), None);
    }

    #[tokio::test]
    async fn test_missing_upload_is_source_unavailable() {
        let def = definition(Platform::Other, upload("/definitely/not/here.mp4"), false);
        let err = launcher("ffmpeg").launch(&def).await.unwrap_err();
        assert!(matches!(err, LaunchError::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_failed() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let def = definition(
            Platform::Other,
            upload(file.path().to_str().unwrap()),
            false,
        );

        let err = launcher("/nonexistent/ffmpeg-binary")
            .launch(&def)
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::LaunchFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launched_process_reports_exit() {
        // `true` ignores its arguments and exits 0.
        let file = tempfile::NamedTempFile::new().unwrap();
        let def = definition(
            Platform::Other,
            upload(file.path().to_str().unwrap()),
            false,
        );

        let mut handle = launcher("true").launch(&def).await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        handle.on_exit(move |outcome| async move {
            let _ = tx.send(outcome);
        });

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_success());

        // Terminating after exit is a no-op.
        handle.terminate();
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(std::sync::Arc<parking_lot::Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stderr_never_logs_stream_key() {
        use std::os::unix::fs::PermissionsExt;

        // Stands in for ffmpeg failing to connect: echoes the output URL.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-ffmpeg");
        std::fs::write(
            &script,
            "#!/bin/sh\nfor last; do :; done\necho \"$last: Input/output error\" >&2\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let source = dir.path().join("clip.mp4");
        std::fs::write(&source, b"").unwrap();
        let def = definition(Platform::Other, upload(source.to_str().unwrap()), false);

        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let mut handle = launcher(script.to_str().unwrap())
            .launch(&def)
            .await
            .unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        handle.on_exit(move |outcome| async move {
            let _ = tx.send(outcome);
        });
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(!outcome.is_success());

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !logs.contents().contains("Input/output error") {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let output = logs.contents();
        assert!(!output.contains("key-123"), "{output}");
        assert!(output.contains("rtmp://ingest.example.com/live/****: Input/output error"));
    }
}
