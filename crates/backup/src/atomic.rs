//! Temp-file-then-rename persistence helpers.
//!
//! Every durable file the pipeline owns is written through these functions so
//! a reader sees either the previous complete file or the new complete file.

use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Directory a temp file for `target` should live in (same filesystem as the target).
fn staging_dir(target: &Path) -> PathBuf {
    match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Writes `bytes` to `target` atomically, creating parent directories as needed.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = staging_dir(target);
    fs::create_dir_all(&dir)?;

    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

/// Serializes `value` as pretty JSON and writes it atomically.
pub fn write_json_atomic<T: Serialize>(target: &Path, value: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_atomic(target, &json)
}

/// Copies `source` to `dest` through a temp file next to `dest`.
///
/// Returns the number of bytes copied.
pub fn copy_atomic(source: &Path, dest: &Path) -> io::Result<u64> {
    let dir = staging_dir(dest);
    fs::create_dir_all(&dir)?;

    let mut input = fs::File::open(source)?;
    let mut tmp = NamedTempFile::new_in(&dir)?;
    let copied = io::copy(&mut input, tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(copied)
}

/// Scratch path next to `dest` for tools that insist on writing to a named file.
///
/// The extension is kept so encoders can infer the output format.
pub fn staging_path(dest: &Path) -> PathBuf {
    let dir = staging_dir(dest);
    let stem = dest
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let name = match dest.extension() {
        Some(ext) => format!(".{}.{}.partial.{}", stem, uuid::Uuid::new_v4(), ext.to_string_lossy()),
        None => format!(".{}.{}.partial", stem, uuid::Uuid::new_v4()),
    };
    dir.join(name)
}

/// Moves a finished staging file into place, removing it on failure.
pub fn promote(staged: &Path, dest: &Path) -> io::Result<()> {
    if let Err(e) = fs::rename(staged, dest) {
        let _ = fs::remove_file(staged);
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_creates_and_replaces() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a").join("b.json");

        write_atomic(&target, b"first").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"first");

        write_atomic(&target, b"second").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"second");

        // No temp files left behind
        let entries: Vec<_> = fs::read_dir(dir.path().join("a")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_abandoned_write_leaves_target_intact() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("state.json");
        write_atomic(&target, b"{\"ok\":true}").unwrap();

        {
            // A writer that dies before rename
            let mut tmp = NamedTempFile::new_in(dir.path()).unwrap();
            tmp.write_all(b"{\"ok\":").unwrap();
        }

        assert_eq!(fs::read(&target).unwrap(), b"{\"ok\":true}");
    }

    #[test]
    fn test_failed_write_keeps_previous_content() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("data.json");
        write_atomic(&target, b"previous").unwrap();

        // Renaming a file over a non-empty directory fails
        let blocked = dir.path().join("blocked");
        fs::create_dir_all(blocked.join("inner")).unwrap();
        assert!(write_atomic(&blocked, b"new").is_err());

        assert_eq!(fs::read(&target).unwrap(), b"previous");
    }

    #[test]
    fn test_copy_atomic() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        fs::write(&src, vec![7u8; 4096]).unwrap();

        let dest = dir.path().join("out").join("dest.bin");
        let copied = copy_atomic(&src, &dest).unwrap();

        assert_eq!(copied, 4096);
        assert_eq!(fs::read(&dest).unwrap(), vec![7u8; 4096]);
    }

    #[test]
    fn test_staging_path_keeps_extension_and_directory() {
        let dest = Path::new("/archive/2020/clip.mp4");
        let staged = staging_path(dest);

        assert_eq!(staged.parent(), Some(Path::new("/archive/2020")));
        assert_eq!(staged.extension().and_then(|e| e.to_str()), Some("mp4"));
        assert_ne!(staged, dest);
    }
}
