//! Content-addressed ledger of archived files.
//!
//! Records are keyed by the SHA-256 of the original file's bytes, so moving or
//! renaming an archived source never triggers reprocessing.

use crate::atomic::write_json_atomic;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// File name of the registry inside the state directory
pub const REGISTRY_FILE: &str = "processed_files.json";

const HASH_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to hash {path}: {source}")]
    Hash {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse registry {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Registry IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedFileRecord {
    pub original_path: PathBuf,
    #[serde(default)]
    pub processed_path: Option<PathBuf>,
    pub original_size: u64,
    #[serde(default)]
    pub processed_size: u64,
    pub original_hash: String,
    #[serde(default)]
    pub processed_hash: Option<String>,
    pub processed_at: DateTime<Utc>,
    #[serde(default)]
    pub quality_tier: String,
    #[serde(default)]
    pub compression_ratio: f64,
    #[serde(default)]
    pub processing_time_ms: u64,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ProcessedFileRecord {
    pub fn is_completed(&self) -> bool {
        self.status == RecordStatus::Completed
    }

    fn extension(&self) -> String {
        crate::media::lowercase_extension(&self.original_path).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_files: usize,
    pub completed_files: usize,
    pub total_original_size: u64,
    pub total_processed_size: u64,
    pub average_compression: f64,
    pub processing_errors: usize,
    pub last_processed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingTimeStats {
    pub count: usize,
    pub average_ms: u64,
    pub total_ms: u64,
    pub files_per_minute: f64,
}

/// Lower-hex SHA-256 of a file's bytes, read in fixed-size chunks
pub fn hash_file(path: &Path) -> Result<String, RegistryError> {
    let wrap = |source| RegistryError::Hash {
        path: path.to_path_buf(),
        source,
    };

    let mut file = fs::File::open(path).map_err(wrap)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf).map_err(wrap)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Persistent map of content hash to processing record
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    records: Mutex<BTreeMap<String, ProcessedFileRecord>>,
}

impl FileRegistry {
    /// Loads the registry at `path`; a missing file starts empty
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let records = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| RegistryError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(RegistryError::Io(e)),
        };

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, records: &BTreeMap<String, ProcessedFileRecord>) -> Result<(), RegistryError> {
        write_json_atomic(&self.path, records)?;
        Ok(())
    }

    /// Hashes `path` and reports whether that content has been archived
    pub fn is_processed(&self, path: &Path) -> Result<(bool, Option<ProcessedFileRecord>), RegistryError> {
        let hash = hash_file(path)?;
        Ok(self.lookup_hash(&hash))
    }

    /// Same as [`is_processed`](Self::is_processed) for an already computed hash.
    ///
    /// Only `completed` records count; an `error` record is returned but does not block a retry.
    pub fn lookup_hash(&self, hash: &str) -> (bool, Option<ProcessedFileRecord>) {
        let records = self.records.lock();
        match records.get(hash) {
            Some(record) => (record.is_completed(), Some(record.clone())),
            None => (false, None),
        }
    }

    /// Inserts or replaces the record for its content hash
    pub fn record(&self, mut entry: ProcessedFileRecord) -> Result<(), RegistryError> {
        entry.compression_ratio = crate::media::compression_ratio(entry.original_size, entry.processed_size);

        let mut records = self.records.lock();
        if let Some(existing) = records.get(&entry.original_hash) {
            if existing.is_completed() && existing.original_path != entry.original_path {
                debug!(
                    hash = %entry.original_hash,
                    previous = %existing.original_path.display(),
                    current = %entry.original_path.display(),
                    "Replacing record for identical content"
                );
            }
        }
        let mut next = records.clone();
        next.insert(entry.original_hash.clone(), entry);
        self.save(&next)?;
        *records = next;
        Ok(())
    }

    /// Hashes `path` and records a failed attempt
    pub fn mark_error(&self, path: &Path, message: &str) -> Result<(), RegistryError> {
        let hash = hash_file(path)?;
        let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        self.mark_error_hash(&hash, path, size, message)
    }

    /// Records a failed attempt for content that was already hashed.
    ///
    /// A `completed` record for the same content is left as is.
    pub fn mark_error_hash(&self, hash: &str, path: &Path, size: u64, message: &str) -> Result<(), RegistryError> {
        let mut records = self.records.lock();
        if let Some(existing) = records.get(hash) {
            if existing.is_completed() {
                debug!(
                    hash = %hash,
                    file = %path.display(),
                    archived_as = %existing.original_path.display(),
                    error = %message,
                    "Ignoring failure for content that is already archived"
                );
                return Ok(());
            }
        }

        let now = Utc::now();
        let mut next = records.clone();
        next.entry(hash.to_string())
            .and_modify(|record| {
                record.status = RecordStatus::Error;
                record.error_message = Some(message.to_string());
                record.processed_at = now;
            })
            .or_insert_with(|| ProcessedFileRecord {
                original_path: path.to_path_buf(),
                processed_path: None,
                original_size: size,
                processed_size: 0,
                original_hash: hash.to_string(),
                processed_hash: None,
                processed_at: now,
                quality_tier: String::new(),
                compression_ratio: 0.0,
                processing_time_ms: 0,
                status: RecordStatus::Error,
                error_message: Some(message.to_string()),
            });
        self.save(&next)?;
        *records = next;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let records = self.records.lock();
        let mut stats = RegistryStats {
            total_files: records.len(),
            ..Default::default()
        };

        let mut compression_sum = 0.0;
        let mut compression_count = 0usize;
        for record in records.values() {
            stats.total_original_size += record.original_size;
            stats.total_processed_size += record.processed_size;

            match record.status {
                RecordStatus::Error => stats.processing_errors += 1,
                RecordStatus::Completed => {
                    stats.completed_files += 1;
                    if record.compression_ratio > 0.0 {
                        compression_sum += record.compression_ratio;
                        compression_count += 1;
                    }
                }
            }

            if stats.last_processed.map_or(true, |last| record.processed_at > last) {
                stats.last_processed = Some(record.processed_at);
            }
        }

        if compression_count > 0 {
            stats.average_compression = compression_sum / compression_count as f64;
        }
        stats
    }

    pub fn by_tier(&self, tier: &str) -> Vec<ProcessedFileRecord> {
        self.records
            .lock()
            .values()
            .filter(|r| r.quality_tier == tier)
            .cloned()
            .collect()
    }

    /// Records processed within the last `within`
    pub fn recent(&self, within: Duration) -> Vec<ProcessedFileRecord> {
        let cutoff = chrono::Duration::from_std(within)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d));
        self.records
            .lock()
            .values()
            .filter(|r| cutoff.map_or(true, |c| r.processed_at > c))
            .cloned()
            .collect()
    }

    /// Average compression ratio per lowercase extension, successful records only
    pub fn compression_by_extension(&self) -> BTreeMap<String, f64> {
        let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        for record in self.records.lock().values() {
            if record.is_completed() && record.compression_ratio > 0.0 {
                let slot = sums.entry(record.extension()).or_insert((0.0, 0));
                slot.0 += record.compression_ratio;
                slot.1 += 1;
            }
        }
        sums.into_iter()
            .map(|(ext, (sum, count))| (ext, sum / count as f64))
            .collect()
    }

    pub fn processing_time_stats(&self) -> ProcessingTimeStats {
        let records = self.records.lock();
        let times: Vec<u64> = records
            .values()
            .filter(|r| r.is_completed() && r.processing_time_ms > 0)
            .map(|r| r.processing_time_ms)
            .collect();

        if times.is_empty() {
            return ProcessingTimeStats::default();
        }

        let total: u64 = times.iter().sum();
        ProcessingTimeStats {
            count: times.len(),
            average_ms: total / times.len() as u64,
            total_ms: total,
            files_per_minute: times.len() as f64 / (total as f64 / 60_000.0),
        }
    }

    /// Writes [`stats`](Self::stats) as JSON to `path`
    pub fn export_stats(&self, path: &Path) -> Result<(), RegistryError> {
        write_json_atomic(path, &self.stats())?;
        Ok(())
    }

    /// Drops records older than `days`, returning how many were removed
    pub fn cleanup_older_than(&self, days: u32) -> Result<usize, RegistryError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let mut records = self.records.lock();
        let next: BTreeMap<_, _> = records
            .iter()
            .filter(|(_, r)| r.processed_at >= cutoff)
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect();
        let removed = records.len() - next.len();
        if removed > 0 {
            self.save(&next)?;
            *records = next;
        }
        Ok(removed)
    }
}
