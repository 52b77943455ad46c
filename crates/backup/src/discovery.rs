//! Discovery of media files under a job's source tree.
//!
//! Walks the tree recursively, applies include/exclude glob patterns and
//! classifies each surviving file as photo or video by extension.

use crate::media::MediaKind;
use glob::{MatchOptions, Pattern, PatternError};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::warn;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: PatternError,
    },

    #[error("Source {path} is not readable: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Source {0} is not a directory")]
    NotADirectory(PathBuf),
}

/// A media file found during discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    /// Path relative to the source root; mirrored under the destination
    pub relative_path: PathBuf,
    pub kind: MediaKind,
    pub size_bytes: u64,
    pub modified_time: SystemTime,
}

/// Compiled include/exclude patterns.
///
/// A pattern matches when it matches either the file name or the path
/// relative to the source root. Exclusion wins over inclusion; an empty
/// include list admits everything.
#[derive(Debug, Clone, Default)]
pub struct PatternFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

fn compile(patterns: &[String]) -> Result<Vec<Pattern>, DiscoveryError> {
    patterns
        .iter()
        .filter(|p| !p.trim().is_empty())
        .map(|p| {
            Pattern::new(p.trim()).map_err(|source| DiscoveryError::Pattern {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}

impl PatternFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, DiscoveryError> {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    fn any_match(patterns: &[Pattern], relative: &Path) -> bool {
        let name = relative.file_name().and_then(|n| n.to_str());
        patterns.iter().any(|p| {
            p.matches_path_with(relative, MATCH_OPTIONS)
                || name.is_some_and(|n| p.matches_with(n, MATCH_OPTIONS))
        })
    }

    pub fn admits(&self, relative: &Path) -> bool {
        if Self::any_match(&self.exclude, relative) {
            return false;
        }
        self.include.is_empty() || Self::any_match(&self.include, relative)
    }
}

/// Walks `root` and returns every admitted photo or video, sorted by path.
///
/// Unreadable entries below the root are logged and skipped; an unreadable
/// root is an error. Hidden directories and files are ignored.
pub fn discover_files(root: &Path, filter: &PatternFilter) -> Result<Vec<DiscoveredFile>, DiscoveryError> {
    let meta = std::fs::metadata(root).map_err(|source| DiscoveryError::Root {
        path: root.to_path_buf(),
        source,
    })?;
    if !meta.is_dir() {
        return Err(DiscoveryError::NotADirectory(root.to_path_buf()));
    }
    std::fs::read_dir(root).map_err(|source| DiscoveryError::Root {
        path: root.to_path_buf(),
        source,
    })?;

    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        // The root itself may be hidden
        entry.depth() == 0
            || !entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with('.'))
    });

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = ?e.path(), error = %e, "Skipping unreadable path during discovery");
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let Some(kind) = MediaKind::from_path(path) else {
            continue;
        };

        let relative = path.strip_prefix(root).unwrap_or(path);
        if !filter.admits(relative) {
            continue;
        }

        match entry.metadata() {
            Ok(metadata) => files.push(DiscoveredFile {
                path: path.to_path_buf(),
                relative_path: relative.to_path_buf(),
                kind,
                size_bytes: metadata.len(),
                modified_time: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            }),
            Err(e) => warn!(file = %path.display(), error = %e, "Skipping file without metadata"),
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}
