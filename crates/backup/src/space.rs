//! Archive space usage and the pressure signal.
//!
//! Usage is the recursive sum of file sizes under the archive root. Scans are
//! cached for a short interval since walking a large archive is not free.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use sysinfo::Disks;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Default lifetime of a usage scan
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("Failed to scan archive root {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// Snapshot of archive usage against its configured limit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpaceStatus {
    pub used_bytes: u64,
    pub limit_bytes: u64,
    pub usage_percent: f64,
    pub pressure_active: bool,
    /// Free space on the disk holding the archive root, if it could be determined
    pub disk_available_bytes: Option<u64>,
    pub disk_total_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct CachedUsage {
    bytes: u64,
    scanned_at: Instant,
}

/// Measures archive usage and raises pressure above `limit * threshold`
#[derive(Debug)]
pub struct SpaceMonitor {
    root: PathBuf,
    limit_bytes: u64,
    threshold: f64,
    cache_ttl: Duration,
    cache: Mutex<Option<CachedUsage>>,
}

/// Sums the sizes of every regular file below `root`.
///
/// A missing root is zero usage. Entries that cannot be read are skipped.
pub fn scan_usage(root: &Path) -> Result<u64, SpaceError> {
    if !root.exists() {
        return Ok(0);
    }

    let mut total = 0u64;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) if e.depth() == 0 => {
                return Err(SpaceError::Scan {
                    path: root.to_path_buf(),
                    source: e,
                })
            }
            Err(e) => {
                warn!(error = %e, "Skipping unreadable entry during usage scan");
                continue;
            }
        };

        if entry.file_type().is_file() {
            match entry.metadata() {
                Ok(meta) => total = total.saturating_add(meta.len()),
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Skipping file without metadata"),
            }
        }
    }
    Ok(total)
}

/// Available and total bytes of the disk whose mount point is the longest prefix of `path`
pub fn disk_space_for(path: &Path) -> Option<(u64, u64)> {
    let disks = Disks::new_with_refreshed_list();
    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

    disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| (disk.available_space(), disk.total_space()))
}

impl SpaceMonitor {
    pub fn new(root: impl Into<PathBuf>, limit_bytes: u64, threshold: f64) -> Self {
        Self {
            root: root.into(),
            limit_bytes,
            threshold,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache: Mutex::new(None),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Current usage, served from cache while it is fresh
    pub fn current_usage(&self) -> u64 {
        if let Some(cached) = *self.cache.lock() {
            if cached.scanned_at.elapsed() < self.cache_ttl {
                return cached.bytes;
            }
        }
        self.refresh()
    }

    /// Rescans the archive regardless of cache age
    pub fn refresh(&self) -> u64 {
        let bytes = match scan_usage(&self.root) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Usage scan failed, keeping last known value");
                let last = *self.cache.lock();
                return last.map(|c| c.bytes).unwrap_or(0);
            }
        };

        debug!(root = %self.root.display(), bytes, "Archive usage scanned");
        *self.cache.lock() = Some(CachedUsage {
            bytes,
            scanned_at: Instant::now(),
        });
        bytes
    }

    /// Percentage of the limit in use; 0 when no limit is configured
    pub fn usage_percent(&self) -> f64 {
        percent_of(self.current_usage(), self.limit_bytes)
    }

    pub fn pressure_active(&self) -> bool {
        self.is_over_threshold(self.current_usage())
    }

    fn is_over_threshold(&self, used: u64) -> bool {
        self.limit_bytes > 0 && used as f64 > self.limit_bytes as f64 * self.threshold
    }

    pub fn status(&self) -> SpaceStatus {
        let used = self.current_usage();
        let disk = disk_space_for(&self.root);

        SpaceStatus {
            used_bytes: used,
            limit_bytes: self.limit_bytes,
            usage_percent: percent_of(used, self.limit_bytes),
            pressure_active: self.is_over_threshold(used),
            disk_available_bytes: disk.map(|(available, _)| available),
            disk_total_bytes: disk.map(|(_, total)| total),
        }
    }
}

fn percent_of(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        0.0
    } else {
        used as f64 / limit as f64 * 100.0
    }
}
