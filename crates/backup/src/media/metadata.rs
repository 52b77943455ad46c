//! Reading tags with exiftool and re-attaching them at a tier's preservation level.

use super::probe::ProbeError;
use super::{run_tool, MediaMetadata, TransformError};
use serde_json::Value;
use std::path::Path;
use std::process::Command;
use tiered_backup_config::MetadataLevel;

/// Tags copied back at the `essential` level
pub const ESSENTIAL_TAGS: &[&str] = &[
    "DateTimeOriginal",
    "CreateDate",
    "Make",
    "Model",
    "GPSLatitude",
    "GPSLongitude",
    "GPSPosition",
    "ImageWidth",
    "ImageHeight",
    "Orientation",
];

/// Tags copied back at the `minimal` level
pub const MINIMAL_TAGS: &[&str] = &["DateTimeOriginal", "CreateDate", "Make", "Model"];

const READ_TAGS: &[&str] = &[
    "-ImageWidth",
    "-ImageHeight",
    "-FileType",
    "-ColorSpace",
    "-DateTimeOriginal",
    "-Make",
    "-Model",
];

/// Reads the tags the transformers care about with `exiftool -j`
pub fn read_metadata(exiftool: &Path, path: &Path) -> Result<MediaMetadata, ProbeError> {
    let output = Command::new(exiftool).args(READ_TAGS).arg("-j").arg(path).output()?;

    if !output.status.success() {
        return Err(ProbeError::ToolFailed {
            tool: "exiftool".to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    parse_exiftool_output(&String::from_utf8_lossy(&output.stdout))
}

fn as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parses exiftool JSON output (an array with one object per file)
pub fn parse_exiftool_output(json_str: &str) -> Result<MediaMetadata, ProbeError> {
    let parsed: Vec<serde_json::Map<String, Value>> =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let tags = parsed
        .into_iter()
        .next()
        .ok_or_else(|| ProbeError::ParseError("exiftool returned no entries".to_string()))?;

    Ok(MediaMetadata {
        width: tags.get("ImageWidth").and_then(as_u32),
        height: tags.get("ImageHeight").and_then(as_u32),
        format: tags.get("FileType").and_then(as_string).map(|f| f.to_uppercase()),
        color_space: tags.get("ColorSpace").and_then(as_string),
        camera_make: tags.get("Make").and_then(as_string),
        camera_model: tags.get("Model").and_then(as_string),
        date_taken: tags.get("DateTimeOriginal").and_then(as_string),
        ..Default::default()
    })
}

/// Builds the exiftool invocation copying tags from `source` onto `dest`.
///
/// Returns `None` for an unrecognized level, which preserves nothing.
pub fn build_restore_command(
    exiftool: &Path,
    source: &Path,
    dest: &Path,
    level: &MetadataLevel,
) -> Option<Command> {
    let tags: Vec<String> = match level {
        MetadataLevel::Full => vec!["-all:all>all:all".to_string()],
        MetadataLevel::Essential => ESSENTIAL_TAGS.iter().map(|t| format!("-{}", t)).collect(),
        MetadataLevel::Minimal => MINIMAL_TAGS.iter().map(|t| format!("-{}", t)).collect(),
        MetadataLevel::Unrecognized(_) => return None,
    };

    let mut cmd = Command::new(exiftool);
    cmd.arg("-overwrite_original")
        .arg("-all:all=")
        .arg("-tagsFromFile")
        .arg(source)
        .args(tags)
        .arg(dest);
    Some(cmd)
}

/// Copies tags back onto a processed file; a missing exiftool is not an error
pub fn restore_metadata(
    exiftool: Option<&Path>,
    source: &Path,
    dest: &Path,
    level: &MetadataLevel,
) -> Result<(), TransformError> {
    let Some(exiftool) = exiftool else {
        return Ok(());
    };

    match build_restore_command(exiftool, source, dest, level) {
        Some(mut cmd) => run_tool(&mut cmd, "exiftool").map(|_| ()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    #[test]
    fn test_parse_exiftool_output() {
        let json = r#"[{
            "SourceFile": "/a/b.jpg",
            "ImageWidth": 4000,
            "ImageHeight": "3000",
            "FileType": "jpeg",
            "Make": "Canon",
            "Model": "EOS R5",
            "DateTimeOriginal": "2019:07:04 12:00:00"
        }]"#;
        let meta = parse_exiftool_output(json).unwrap();

        assert_eq!(meta.width, Some(4000));
        assert_eq!(meta.height, Some(3000));
        assert_eq!(meta.format.as_deref(), Some("JPEG"));
        assert_eq!(meta.camera_model.as_deref(), Some("EOS R5"));
        assert_eq!(meta.date_taken.as_deref(), Some("2019:07:04 12:00:00"));
        assert_eq!(meta.color_space, None);
    }

    #[test]
    fn test_parse_exiftool_empty_array() {
        assert!(parse_exiftool_output("[]").is_err());
    }

    #[test]
    fn test_restore_command_per_level() {
        let tool = Path::new("exiftool");
        let src = Path::new("/in/a.jpg");
        let dest = Path::new("/out/a.jpg");

        let full = command_args(&build_restore_command(tool, src, dest, &MetadataLevel::Full).unwrap());
        assert!(full.contains(&"-all:all>all:all".to_string()));
        assert_eq!(full.last().map(String::as_str), Some("/out/a.jpg"));
        assert!(full.windows(2).any(|w| w[0] == "-tagsFromFile" && w[1] == "/in/a.jpg"));

        let essential =
            command_args(&build_restore_command(tool, src, dest, &MetadataLevel::Essential).unwrap());
        assert!(essential.contains(&"-GPSPosition".to_string()));
        assert!(essential.contains(&"-Orientation".to_string()));

        let minimal =
            command_args(&build_restore_command(tool, src, dest, &MetadataLevel::Minimal).unwrap());
        assert!(minimal.contains(&"-Model".to_string()));
        assert!(!minimal.contains(&"-GPSPosition".to_string()));

        assert!(build_restore_command(
            tool,
            src,
            dest,
            &MetadataLevel::Unrecognized("x".to_string())
        )
        .is_none());
    }

    #[test]
    fn test_restore_without_exiftool_is_noop() {
        let result = restore_metadata(
            None,
            Path::new("/in/a.jpg"),
            Path::new("/out/a.jpg"),
            &MetadataLevel::Full,
        );
        assert!(result.is_ok());
    }
}
