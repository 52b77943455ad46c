//! Reading dimensions, codecs and frame rates from media files.
//!
//! Videos are probed with ffprobe's JSON output; photos fall back to
//! ImageMagick `identify` when exiftool is not installed.

use super::MediaMetadata;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Probe command failed to execute.
    #[error("{tool} failed: {message}")]
    ToolFailed { tool: String, message: String },

    /// Failed to parse probe output.
    #[error("Failed to parse probe output: {0}")]
    ParseError(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub r_frame_rate: Option<String>,
        pub bit_rate: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub format_name: Option<String>,
        pub duration: Option<String>,
        pub bit_rate: Option<String>,
    }
}

fn run_probe(mut cmd: Command, tool: &str) -> Result<String, ProbeError> {
    let output = cmd.output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::ToolFailed {
            tool: tool.to_string(),
            message: format!("exited with status {}: {}", output.status, stderr.trim()),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Probes a video file with ffprobe.
///
/// Runs `ffprobe -v quiet -print_format json -show_streams -show_format <path>`.
pub fn probe_video(ffprobe: &Path, path: &Path) -> Result<MediaMetadata, ProbeError> {
    let mut cmd = Command::new(ffprobe);
    cmd.args([
        "-v",
        "quiet",
        "-print_format",
        "json",
        "-show_streams",
        "-show_format",
    ])
    .arg(path);

    let stdout = run_probe(cmd, "ffprobe")?;
    parse_ffprobe_output(&stdout)
}

/// Parses ffprobe JSON output, using the first video stream.
pub fn parse_ffprobe_output(json_str: &str) -> Result<MediaMetadata, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let video = ffprobe
        .streams
        .unwrap_or_default()
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| ProbeError::ParseError("No video stream found".to_string()))?;

    let bit_rate = video
        .bit_rate
        .as_deref()
        .or(format.bit_rate.as_deref())
        .and_then(|br| br.parse::<u64>().ok());

    Ok(MediaMetadata {
        width: video.width,
        height: video.height,
        video_codec: video.codec_name,
        frame_rate: video.r_frame_rate.as_deref().and_then(parse_frame_rate),
        duration_secs: format.duration.as_deref().and_then(|d| d.parse::<f64>().ok()),
        bit_rate,
        container: format.format_name,
        ..Default::default()
    })
}

/// Parses an ffprobe rational frame rate such as `30000/1001` or `25`
pub fn parse_frame_rate(rate: &str) -> Option<f64> {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                None
            } else {
                Some(num / den)
            }
        }
        None => rate.trim().parse().ok(),
    }
}

/// Reads width, height, format and colorspace with ImageMagick `identify`
pub fn identify_photo(identify: &Path, path: &Path) -> Result<MediaMetadata, ProbeError> {
    let mut cmd = Command::new(identify);
    cmd.args(["-format", "%w,%h,%m,%[colorspace]"]).arg(path);

    let stdout = run_probe(cmd, "identify")?;
    parse_identify_output(&stdout)
}

/// Parses `identify -format %w,%h,%m,%[colorspace]` output
pub fn parse_identify_output(output: &str) -> Result<MediaMetadata, ProbeError> {
    let parts: Vec<&str> = output.trim().split(',').collect();
    if parts.len() < 4 {
        return Err(ProbeError::ParseError(format!(
            "unexpected identify output: {}",
            output.trim()
        )));
    }

    Ok(MediaMetadata {
        width: parts[0].trim().parse().ok(),
        height: parts[1].trim().parse().ok(),
        format: Some(parts[2].trim().to_uppercase()),
        color_space: Some(parts[3].trim().to_string()),
        ..Default::default()
    })
}
