//! Photo transformer backed by ImageMagick and exiftool.

use super::metadata::{read_metadata, restore_metadata};
use super::probe::identify_photo;
use super::{
    lowercase_extension, run_tool, MediaKind, MediaMetadata, MediaTransformer, ProcessingResult,
    ToolPaths, TransformAction, TransformError,
};
use crate::atomic::{copy_atomic, promote, staging_path};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;
use tiered_backup_config::QualityTier;
use tracing::{debug, warn};

/// JPEGs are re-encoded whenever the tier asks for less than this quality
const JPEG_REENCODE_BELOW_QUALITY: u32 = 95;

#[derive(Debug, Clone)]
pub struct PhotoTransformer {
    tools: ToolPaths,
}

fn is_heif(format: &str) -> bool {
    matches!(format, "HEIC" | "HEIF")
}

/// Format name from metadata, or guessed from the file extension
fn effective_format(source: &Path, metadata: &MediaMetadata) -> Option<String> {
    if let Some(format) = &metadata.format {
        return Some(format.clone());
    }
    lowercase_extension(source).map(|ext| match ext.as_str() {
        "jpg" | "jpeg" => "JPEG".to_string(),
        "tif" => "TIFF".to_string(),
        other => other.to_uppercase(),
    })
}

/// Whether a photo must go through the encoder for this tier
pub fn needs_processing(format: Option<&str>, metadata: &MediaMetadata, tier: &QualityTier) -> bool {
    if metadata.pixel_count().is_some_and(|px| px > tier.photo_max_resolution) {
        return true;
    }
    match format {
        Some(f) if is_heif(f) => true,
        Some("JPEG") => tier.photo_quality < JPEG_REENCODE_BELOW_QUALITY,
        _ => false,
    }
}

/// Target dimensions that fit `max_pixels` while keeping the aspect ratio
pub fn fit_resolution(width: u32, height: u32, max_pixels: u64) -> Option<(u32, u32)> {
    let pixels = u64::from(width) * u64::from(height);
    if pixels <= max_pixels || pixels == 0 {
        return None;
    }
    let scale = (max_pixels as f64 / pixels as f64).sqrt();
    let w = ((f64::from(width) * scale).floor() as u32).max(1);
    let h = ((f64::from(height) * scale).floor() as u32).max(1);
    Some((w, h))
}

/// Final path for a processed photo; HEIC/HEIF become JPEG
pub fn output_path(dest: &Path, format: Option<&str>) -> PathBuf {
    match format {
        Some(f) if is_heif(f) => dest.with_extension("jpg"),
        _ => dest.to_path_buf(),
    }
}

/// Builds the ImageMagick invocation for a tier
pub fn build_convert_command(
    convert: &Path,
    source: &Path,
    output: &Path,
    tier: &QualityTier,
    metadata: &MediaMetadata,
) -> Command {
    let mut cmd = Command::new(convert);
    cmd.arg(source);

    if let (Some(w), Some(h)) = (metadata.width, metadata.height) {
        if let Some((new_w, new_h)) = fit_resolution(w, h, tier.photo_max_resolution) {
            cmd.arg("-resize").arg(format!("{}x{}>", new_w, new_h));
        }
    }

    cmd.arg("-quality").arg(tier.photo_quality.to_string());
    cmd.arg("-colorspace").arg("sRGB");
    cmd.arg("-auto-orient");
    cmd.arg("-strip");
    cmd.arg(output);
    cmd
}

impl PhotoTransformer {
    pub fn new(tools: ToolPaths) -> Self {
        Self { tools }
    }

    fn extract_metadata(&self, source: &Path) -> MediaMetadata {
        let result = match (&self.tools.exiftool, &self.tools.identify) {
            (Some(exiftool), _) => read_metadata(exiftool, source),
            (None, Some(identify)) => identify_photo(identify, source),
            (None, None) => return MediaMetadata::default(),
        };
        result.unwrap_or_else(|e| {
            debug!(file = %source.display(), error = %e, "Failed to extract photo metadata");
            MediaMetadata::default()
        })
    }

    fn convert(
        &self,
        convert: &Path,
        source: &Path,
        output: &Path,
        tier: &QualityTier,
        metadata: &MediaMetadata,
    ) -> Result<(), TransformError> {
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        let staged = staging_path(output);
        let mut cmd = build_convert_command(convert, source, &staged, tier, metadata);
        if let Err(e) = run_tool(&mut cmd, "convert") {
            let _ = fs::remove_file(&staged);
            return Err(e);
        }

        if let Err(e) = restore_metadata(
            self.tools.exiftool.as_deref(),
            source,
            &staged,
            &tier.metadata_level,
        ) {
            warn!(file = %output.display(), error = %e, "Failed to preserve metadata");
        }

        promote(&staged, output)?;
        Ok(())
    }
}

impl MediaTransformer for PhotoTransformer {
    fn kind(&self) -> MediaKind {
        MediaKind::Photo
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

        let metadata = self.extract_metadata(source);
        let format = effective_format(source, &metadata);
        let needed = needs_processing(format.as_deref(), &metadata, tier);
        result.metadata = metadata;

        match (&self.tools.convert, needed) {
            (Some(convert), true) => {
                let output = output_path(dest, format.as_deref());
                result.processed_path = output.clone();
                result.action = TransformAction::Transcoded;
                if let Err(e) = self.convert(convert, source, &output, tier, &result.metadata) {
                    result.error = Some(format!("processing image: {}", e));
                }
            }
            (None, true) | (_, false) => {
                if needed {
                    warn!(file = %source.display(), "ImageMagick not available, copying without processing");
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
            "Photo processed"
        );
        result
    }
}
