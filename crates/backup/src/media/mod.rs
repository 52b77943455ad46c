//! Photo and video transformers.
//!
//! A transformer takes a source file and a resolved tier and produces an
//! archived copy, either verbatim or re-encoded through an external tool.
//! Tool failures never escape as `Err`: they land in `ProcessingResult::error`.

pub mod metadata;
pub mod photo;
pub mod probe;
pub mod video;

pub use photo::PhotoTransformer;
pub use probe::ProbeError;
pub use video::VideoTransformer;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{Duration, Instant};
use thiserror::Error;
use tiered_backup_config::QualityTier;

/// Photo file extensions (case-insensitive matching).
pub const PHOTO_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "tiff", "tif", "heic", "heif", "webp", "bmp", "gif",
];

/// Video file extensions (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "avi", "mkv", "m4v", "hevc", "h264", "h265", "wmv", "flv", "webm",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    /// Classifies a path by its extension
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = lowercase_extension(path)?;
        if PHOTO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Photo)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(MediaKind::Video)
        } else {
            None
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Photo => write!(f, "photo"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

pub(crate) fn lowercase_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
}

/// Checks if a file has a photo extension (case-insensitive).
pub fn is_photo_file(path: &Path) -> bool {
    MediaKind::from_path(path) == Some(MediaKind::Photo)
}

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    MediaKind::from_path(path) == Some(MediaKind::Video)
}

/// Locations of the external tools; any of them may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolPaths {
    /// ImageMagick `convert` (or `magick`)
    pub convert: Option<PathBuf>,
    /// ImageMagick `identify`
    pub identify: Option<PathBuf>,
    pub exiftool: Option<PathBuf>,
    pub ffmpeg: Option<PathBuf>,
    pub ffprobe: Option<PathBuf>,
}

impl ToolPaths {
    /// Looks every tool up on `PATH`
    pub fn discover() -> Self {
        let find = |name: &str| which::which(name).ok();
        Self {
            convert: find("convert").or_else(|| find("magick")),
            identify: find("identify"),
            exiftool: find("exiftool"),
            ffmpeg: find("ffmpeg"),
            ffprobe: find("ffprobe"),
        }
    }

    /// No tools at all: every file is copied verbatim
    pub fn none() -> Self {
        Self::default()
    }
}

/// Properties read from a media file before transformation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Upper-case format name, e.g. `JPEG`, `HEIC`
    pub format: Option<String>,
    pub color_space: Option<String>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub date_taken: Option<String>,
    pub video_codec: Option<String>,
    pub frame_rate: Option<f64>,
    pub duration_secs: Option<f64>,
    pub bit_rate: Option<u64>,
    pub container: Option<String>,
}

impl MediaMetadata {
    pub fn pixel_count(&self) -> Option<u64> {
        match (self.width, self.height) {
            (Some(w), Some(h)) => Some(u64::from(w) * u64::from(h)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformAction {
    /// Source bytes archived as-is
    Copied,
    /// Re-encoded by an external tool
    Transcoded,
}

/// Outcome of archiving one file
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingResult {
    pub original_path: PathBuf,
    /// Final location; may differ from the requested destination by extension
    pub processed_path: PathBuf,
    pub original_size: u64,
    pub processed_size: u64,
    pub compression_ratio: f64,
    pub duration: Duration,
    pub tier_name: String,
    pub metadata: MediaMetadata,
    pub action: TransformAction,
    pub error: Option<String>,
}

impl ProcessingResult {
    pub fn new(source: &Path, dest: &Path, tier: &QualityTier) -> Self {
        Self {
            original_path: source.to_path_buf(),
            processed_path: dest.to_path_buf(),
            original_size: 0,
            processed_size: 0,
            compression_ratio: 0.0,
            duration: Duration::ZERO,
            tier_name: tier.name.clone(),
            metadata: MediaMetadata::default(),
            action: TransformAction::Copied,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Records the output size and elapsed time
    pub(crate) fn finish(mut self, started: Instant) -> Self {
        if self.error.is_none() {
            self.processed_size = fs::metadata(&self.processed_path).map(|m| m.len()).unwrap_or(0);
            self.compression_ratio = compression_ratio(self.original_size, self.processed_size);
        }
        self.duration = started.elapsed();
        self
    }
}

/// `1 - processed / original`, 0 when the original is empty
pub fn compression_ratio(original: u64, processed: u64) -> f64 {
    if original == 0 {
        0.0
    } else {
        1.0 - processed as f64 / original as f64
    }
}

/// Error type for external tool invocations
#[derive(Debug, Error)]
pub enum TransformError {
    /// Tool exited with non-zero status
    #[error("{tool} failed with exit code {code}: {stderr}")]
    ToolFailed {
        tool: String,
        code: i32,
        stderr: String,
    },

    /// Tool was terminated by signal
    #[error("{tool} was terminated by signal")]
    ToolTerminated { tool: String },

    #[error("Probe failed: {0}")]
    Probe(#[from] ProbeError),

    /// IO error while running a tool or moving its output
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs a prepared tool command, mapping a failed exit status to an error
pub(crate) fn run_tool(cmd: &mut Command, tool: &str) -> Result<Output, TransformError> {
    let output = cmd.output()?;
    if output.status.success() {
        return Ok(output);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    let tail: String = stderr
        .char_indices()
        .rev()
        .nth(499)
        .map(|(i, _)| stderr[i..].to_string())
        .unwrap_or_else(|| stderr.to_string());

    match output.status.code() {
        Some(code) => Err(TransformError::ToolFailed {
            tool: tool.to_string(),
            code,
            stderr: tail,
        }),
        None => Err(TransformError::ToolTerminated {
            tool: tool.to_string(),
        }),
    }
}

/// Turns a source file into an archived one for a given tier
pub trait MediaTransformer: Send + Sync {
    fn kind(&self) -> MediaKind;

    fn process(&self, source: &Path, dest: &Path, tier: &QualityTier) -> ProcessingResult;
}

/// Tool paths and shell scripts for exercising transformers without real encoders
#[cfg(all(test, unix))]
pub(crate) mod test_tools {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Writes an executable `/bin/sh` script into `dir`
    pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// A tool that writes `content` to its last argument
    pub fn writes_last_arg(dir: &Path, name: &str, content: &str) -> PathBuf {
        script(
            dir,
            name,
            &format!("for last; do :; done\nprintf '%s' '{}' > \"$last\"", content),
        )
    }

    /// A tool that always fails
    pub fn failing(dir: &Path, name: &str) -> PathBuf {
        script(dir, name, "echo 'simulated failure' >&2\nexit 3")
    }
}
