//! Video transformer backed by ffmpeg and ffprobe.

use super::metadata::restore_metadata;
use super::probe::probe_video;
use super::{
    lowercase_extension, MediaKind, MediaMetadata, MediaTransformer, ProcessingResult, ToolPaths,
    TransformAction, TransformError,
};
use crate::atomic::{copy_atomic, promote, staging_path};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tiered_backup_config::QualityTier;
use tracing::{debug, warn};

/// Called with the encode percentage (0-100) while ffmpeg runs
pub type EncodeProgress = Arc<dyn Fn(f64) + Send + Sync>;

const CANONICAL_CONTAINER: &str = "mp4";

#[derive(Clone)]
pub struct VideoTransformer {
    tools: ToolPaths,
    progress: Option<EncodeProgress>,
}

impl std::fmt::Debug for VideoTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoTransformer")
            .field("tools", &self.tools)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

fn is_h264(codec: Option<&str>) -> bool {
    matches!(codec, Some("h264") | Some("x264"))
}

/// Whether a video must be re-encoded for this tier
pub fn needs_transcoding(source: &Path, metadata: &MediaMetadata, tier: &QualityTier) -> bool {
    if metadata.height.is_some_and(|h| h > tier.video_max_height) {
        return true;
    }
    if metadata.frame_rate.is_some_and(|fps| fps > f64::from(tier.video_max_fps)) {
        return true;
    }
    if !is_h264(metadata.video_codec.as_deref()) {
        return true;
    }
    lowercase_extension(source).as_deref() != Some(CANONICAL_CONTAINER)
}

/// Scaled dimensions capped at `max_height`, both even
pub fn scaled_dimensions(width: u32, height: u32, max_height: u32) -> Option<(u32, u32)> {
    if height <= max_height || height == 0 {
        return None;
    }
    let new_height = max_height & !1;
    let new_width = (u64::from(width) * u64::from(new_height) / u64::from(height)) as u32 & !1;
    Some((new_width.max(2), new_height.max(2)))
}

/// Transcoded videos always land in an mp4 container
pub fn output_path(dest: &Path) -> PathBuf {
    dest.with_extension(CANONICAL_CONTAINER)
}

/// Builds the ffmpeg invocation for a tier
pub fn build_ffmpeg_command(
    ffmpeg: &Path,
    source: &Path,
    output: &Path,
    tier: &QualityTier,
    metadata: &MediaMetadata,
) -> Command {
    let mut cmd = Command::new(ffmpeg);

    cmd.arg("-i").arg(source);
    cmd.arg("-c:v").arg("libx264");
    cmd.arg("-preset").arg("medium");
    cmd.arg("-crf").arg(tier.video_crf.to_string());
    cmd.arg("-c:a").arg("aac");
    cmd.arg("-b:a").arg("128k");
    cmd.arg("-movflags").arg("+faststart");
    cmd.arg("-y");

    if let (Some(w), Some(h)) = (metadata.width, metadata.height) {
        if let Some((new_w, new_h)) = scaled_dimensions(w, h, tier.video_max_height) {
            cmd.arg("-vf").arg(format!("scale={}:{}", new_w, new_h));
        }
    }

    if metadata.frame_rate.is_some_and(|fps| fps > f64::from(tier.video_max_fps)) {
        cmd.arg("-r").arg(tier.video_max_fps.to_string());
    }

    cmd.arg(output);
    cmd
}

/// Extracts the `time=HH:MM:SS.cc` position from an ffmpeg status line
pub fn parse_progress_time(line: &str) -> Option<Duration> {
    let start = line.find("time=")? + "time=".len();
    let stamp: String = line[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ':' || *c == '.')
        .collect();

    let mut parts = stamp.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(Duration::from_secs(hours * 3600 + minutes * 60) + Duration::from_secs_f64(seconds))
}

/// Runs ffmpeg, feeding status lines from stderr into `progress`
fn run_with_progress(
    mut cmd: Command,
    total: Option<Duration>,
    progress: Option<&EncodeProgress>,
) -> Result<(), TransformError> {
    cmd.stdout(Stdio::null()).stderr(Stdio::piped());
    let mut child = cmd.spawn()?;

    let mut tail = String::new();
    if let Some(stderr) = child.stderr.take() {
        // ffmpeg separates status updates with carriage returns
        for chunk in BufReader::new(stderr).split(b'\r') {
            let chunk = chunk?;
            let text = String::from_utf8_lossy(&chunk);
            for line in text.lines() {
                if let (Some(cb), Some(total), Some(at)) = (progress, total, parse_progress_time(line)) {
                    if !total.is_zero() {
                        cb((at.as_secs_f64() / total.as_secs_f64() * 100.0).min(100.0));
                    }
                }
                if !line.trim().is_empty() {
                    tail = line.trim().to_string();
                }
            }
        }
    }

    let status = child.wait()?;
    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => Err(TransformError::ToolFailed {
            tool: "ffmpeg".to_string(),
            code,
            stderr: tail,
        }),
        None => Err(TransformError::ToolTerminated {
            tool: "ffmpeg".to_string(),
        }),
    }
}

impl VideoTransformer {
    pub fn new(tools: ToolPaths) -> Self {
        Self {
            tools,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: EncodeProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    fn extract_metadata(&self, source: &Path) -> MediaMetadata {
        let Some(ffprobe) = &self.tools.ffprobe else {
            return MediaMetadata::default();
        };
        probe_video(ffprobe, source).unwrap_or_else(|e| {
            debug!(file = %source.display(), error = %e, "Failed to probe video");
            MediaMetadata::default()
        })
    }

    fn transcode(
        &self,
        ffmpeg: &Path,
        source: &Path,
        output: &Path,
        tier: &QualityTier,
        metadata: &MediaMetadata,
    ) -> Result<(), TransformError> {
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        let staged = staging_path(output);
        let cmd = build_ffmpeg_command(ffmpeg, source, &staged, tier, metadata);
        let total = metadata.duration_secs.filter(|d| *d > 0.0).map(Duration::from_secs_f64);

        if let Err(e) = run_with_progress(cmd, total, self.progress.as_ref()) {
            let _ = fs::remove_file(&staged);
            return Err(e);
        }

        if let Err(e) = restore_metadata(
            self.tools.exiftool.as_deref(),
            source,
            &staged,
            &tier.metadata_level,
        ) {
            warn!(file = %output.display(), error = %e, "Failed to preserve video metadata");
        }

        promote(&staged, output)?;
        Ok(())
    }
}

impl MediaTransformer for VideoTransformer {
    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn process(&self, source: &Path, dest: &Path, tier: &QualityTier) -> ProcessingResult {
        let started = Instant::now();
        let mut result = ProcessingResult::new(source, dest, tier);

        match fs::metadata(source) {
            Ok(meta) => result.original_size = meta.len(),
            Err(e) => {
                result.error = Some(format!("reading source: {}", e));
                return result.finish(started);
            }
        }

        result.metadata = self.extract_metadata(source);
        let needed = needs_transcoding(source, &result.metadata, tier);

        match (&self.tools.ffmpeg, needed) {
            (Some(ffmpeg), true) => {
                let output = output_path(dest);
                result.processed_path = output.clone();
                result.action = TransformAction::Transcoded;
                if let Err(e) = self.transcode(ffmpeg, source, &output, tier, &result.metadata) {
                    result.error = Some(format!("transcoding video: {}", e));
                }
            }
            (None, true) | (_, false) => {
                if needed {
                    warn!(file = %source.display(), "ffmpeg not available, copying without transcoding");
                }
                if let Err(e) = copy_atomic(source, dest) {
                    result.error = Some(format!("copying file: {}", e));
                }
            }
        }

        let result = result.finish(started);
        debug!(
            file = %source.display(),
            tier = %tier.name,
            original_size = result.original_size,
            processed_size = result.processed_size,
            compression = %format!("{:.1}%", result.compression_ratio * 100.0),
            "Video processed"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;
    use tiered_backup_config::MetadataLevel;

    fn tier(max_height: u32, fps: u32, crf: u32) -> QualityTier {
        QualityTier {
            name: "Videos".to_string(),
            age_threshold_days: 365,
            photo_max_resolution: 12_000_000,
            photo_quality: 90,
            video_max_height: max_height,
            video_max_fps: fps,
            video_crf: crf,
            metadata_level: MetadataLevel::Minimal,
        }
    }

    fn probed(width: u32, height: u32, fps: f64, codec: &str) -> MediaMetadata {
        MediaMetadata {
            width: Some(width),
            height: Some(height),
            frame_rate: Some(fps),
            video_codec: Some(codec.to_string()),
            duration_secs: Some(10.0),
            ..Default::default()
        }
    }

    fn command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    #[test]
    fn test_needs_transcoding_rules() {
        let t = tier(1080, 30, 23);
        let mp4 = Path::new("/a/clip.mp4");

        assert!(!needs_transcoding(mp4, &probed(1920, 1080, 30.0, "h264"), &t));
        assert!(needs_transcoding(mp4, &probed(3840, 2160, 30.0, "h264"), &t));
        assert!(needs_transcoding(mp4, &probed(1920, 1080, 60.0, "h264"), &t));
        assert!(needs_transcoding(mp4, &probed(1920, 1080, 30.0, "hevc"), &t));
        assert!(needs_transcoding(Path::new("/a/clip.mov"), &probed(1920, 1080, 30.0, "h264"), &t));
        // Unknown codec means the probe failed; transcode to be safe
        assert!(needs_transcoding(mp4, &MediaMetadata::default(), &t));
    }

    #[test]
    fn test_ffmpeg_command_args() {
        let cmd = build_ffmpeg_command(
            Path::new("ffmpeg"),
            Path::new("/in/clip.mov"),
            Path::new("/out/clip.mp4"),
            &tier(720, 30, 26),
            &probed(1920, 1080, 60.0, "hevc"),
        );
        let args = command_args(&cmd);

        assert_eq!(cmd.get_program(), std::ffi::OsStr::new("ffmpeg"));
        assert!(has_flag_with_value(&args, "-i", "/in/clip.mov"));
        assert!(has_flag_with_value(&args, "-c:v", "libx264"));
        assert!(has_flag_with_value(&args, "-preset", "medium"));
        assert!(has_flag_with_value(&args, "-crf", "26"));
        assert!(has_flag_with_value(&args, "-c:a", "aac"));
        assert!(has_flag_with_value(&args, "-b:a", "128k"));
        assert!(has_flag_with_value(&args, "-movflags", "+faststart"));
        assert!(has_flag_with_value(&args, "-vf", "scale=1280:720"));
        assert!(has_flag_with_value(&args, "-r", "30"));
        assert!(args.contains(&"-y".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/out/clip.mp4"));
    }

    #[test]
    fn test_ffmpeg_command_without_scaling() {
        let cmd = build_ffmpeg_command(
            Path::new("ffmpeg"),
            Path::new("/in/clip.avi"),
            Path::new("/out/clip.mp4"),
            &tier(1080, 30, 23),
            &probed(1280, 720, 25.0, "mpeg4"),
        );
        let args = command_args(&cmd);
        assert!(!args.contains(&"-vf".to_string()));
        assert!(!args.contains(&"-r".to_string()));
    }

    #[test]
    fn test_parse_progress_time() {
        let line = "frame= 1200 fps= 48 q=28.0 size=  10240kB time=00:01:05.50 bitrate=1280.0kbits/s";
        assert_eq!(parse_progress_time(line), Some(Duration::from_millis(65_500)));
        assert_eq!(parse_progress_time("no timestamp here"), None);
        assert_eq!(parse_progress_time("time=N/A"), None);
    }

    #[test]
    fn test_output_path_forces_mp4() {
        assert_eq!(output_path(Path::new("/a/b.MOV")), PathBuf::from("/a/b.mp4"));
        assert_eq!(output_path(Path::new("/a/b.mp4")), PathBuf::from("/a/b.mp4"));
    }

    #[test]
    fn test_missing_encoder_copies_verbatim() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("clip.mov");
        fs::write(&src, vec![9u8; 64]).unwrap();
        let dest = dir.path().join("out").join("clip.mov");

        let result = VideoTransformer::new(ToolPaths::none()).process(&src, &dest, &tier(1080, 30, 23));

        assert!(result.is_success());
        assert_eq!(result.action, TransformAction::Copied);
        assert_eq!(result.processed_path, dest);
        assert_eq!(fs::read(&dest).unwrap(), vec![9u8; 64]);
    }

    #[cfg(unix)]
    #[test]
    fn test_transcode_reports_progress_and_output() {
        use super::super::test_tools;
        use std::sync::Mutex;

        let dir = TempDir::new().unwrap();
        let ffmpeg = test_tools::script(
            dir.path(),
            "ffmpeg",
            "for last; do :; done\n\
             printf 'frame=1 time=00:00:05.00 bitrate=1\\r' >&2\n\
             printf 'tiny' > \"$last\"",
        );
        let ffprobe = test_tools::script(
            dir.path(),
            "ffprobe",
            r#"echo '{"streams":[{"codec_type":"video","codec_name":"hevc","width":1920,"height":1080,"r_frame_rate":"30/1"}],"format":{"format_name":"mov","duration":"10.0"}}'"#,
        );
        let src = dir.path().join("clip.mov");
        fs::write(&src, vec![0u8; 400]).unwrap();
        let dest = dir.path().join("out").join("clip.mov");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let transformer = VideoTransformer::new(ToolPaths {
            ffmpeg: Some(ffmpeg),
            ffprobe: Some(ffprobe),
            ..ToolPaths::none()
        })
        .with_progress(Arc::new(move |pct| sink.lock().unwrap().push(pct)));

        let result = transformer.process(&src, &dest, &tier(1080, 30, 23));

        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.action, TransformAction::Transcoded);
        assert_eq!(result.processed_path, dir.path().join("out").join("clip.mp4"));
        assert_eq!(fs::read(&result.processed_path).unwrap(), b"tiny");
        assert_eq!(result.metadata.video_codec.as_deref(), Some("hevc"));
        assert!((result.compression_ratio - 0.99).abs() < 1e-9);
        assert_eq!(*seen.lock().unwrap(), vec![50.0]);
    }

    #[cfg(unix)]
    #[test]
    fn test_encoder_failure_is_result_error() {
        use super::super::test_tools;

        let dir = TempDir::new().unwrap();
        let ffmpeg = test_tools::failing(dir.path(), "ffmpeg");
        let src = dir.path().join("clip.avi");
        fs::write(&src, vec![0u8; 10]).unwrap();
        let dest = dir.path().join("out").join("clip.avi");

        let transformer = VideoTransformer::new(ToolPaths {
            ffmpeg: Some(ffmpeg),
            ..ToolPaths::none()
        });
        let result = transformer.process(&src, &dest, &tier(1080, 30, 23));

        let error = result.error.expect("transcode should fail");
        assert!(error.contains("ffmpeg failed with exit code 3"), "{}", error);
        assert!(!dir.path().join("out").join("clip.mp4").exists());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Scaled output never exceeds the height cap and both sides are even
        #[test]
        fn prop_scaled_dimensions_even_and_capped(
            width in 2u32..8000,
            height in 2u32..5000,
            max_height in 2u32..2200,
        ) {
            match scaled_dimensions(width, height, max_height) {
                Some((w, h)) => {
                    prop_assert!(height > max_height);
                    prop_assert!(h <= max_height);
                    prop_assert_eq!(w % 2, 0);
                    prop_assert_eq!(h % 2, 0);
                }
                None => prop_assert!(height <= max_height),
            }
        }
    }
}
