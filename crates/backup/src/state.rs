//! Durable progress snapshots for running jobs and system-wide run history.
//!
//! Each running job has `state/progress-<id>.json`; history lives in
//! `state/system_state.json`. Every write goes through [`write_json_atomic`],
//! so a poller never reads a half-written snapshot.

use crate::atomic::write_json_atomic;
use crate::jobs::{is_valid_id, JobStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, warn};

const PROGRESS_PREFIX: &str = "progress-";
const SYSTEM_STATE_FILE: &str = "system_state.json";

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("No state recorded for job {0}")]
    NotFound(String),

    #[error("Failed to parse state file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("State store IO error: {0}")]
    Io(#[from] io::Error),
}

/// Timing for one named phase of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseStats {
    pub phase: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub files_count: u64,
    pub elapsed_ms: u64,
}

impl PhaseStats {
    fn close(&mut self, at: DateTime<Utc>) {
        if self.end_time.is_none() {
            self.end_time = Some(at);
            self.elapsed_ms = (at - self.start_time).num_milliseconds().max(0) as u64;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompressionStats {
    pub original_bytes: u64,
    pub compressed_bytes: u64,
    pub compression_ratio: f64,
    pub space_saved: u64,
}

/// Progress snapshot of one running job.
///
/// `progress`, `estimated_completion` and the compression ratio are derived
/// and recomputed on every save.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobState {
    pub id: String,
    pub status: JobStatus,
    /// Percent of discovered files handled so far
    pub progress: f64,
    pub processed_files: u64,
    pub total_files: u64,
    pub processed_bytes: u64,
    pub total_bytes: u64,
    pub current_file: Option<String>,
    pub current_phase: Option<String>,
    /// Files per minute
    pub processing_rate: f64,
    pub start_time: DateTime<Utc>,
    pub estimated_completion: Option<DateTime<Utc>>,
    #[serde(default)]
    pub phase_stats: BTreeMap<String, PhaseStats>,
    #[serde(default)]
    pub compression: CompressionStats,
    pub error_count: u64,
    pub last_error: Option<String>,
}

impl JobState {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: JobStatus::Running,
            progress: 0.0,
            processed_files: 0,
            total_files: 0,
            processed_bytes: 0,
            total_bytes: 0,
            current_file: None,
            current_phase: None,
            processing_rate: 0.0,
            start_time: Utc::now(),
            estimated_completion: None,
            phase_stats: BTreeMap::new(),
            compression: CompressionStats::default(),
            error_count: 0,
            last_error: None,
        }
    }

    fn recompute(&mut self, now: DateTime<Utc>) {
        if self.total_files > 0 {
            self.progress = self.processed_files as f64 / self.total_files as f64 * 100.0;
        }

        if self.processed_files > 0 && self.total_files > 0 && self.processing_rate > 0.0 {
            let remaining = self.total_files.saturating_sub(self.processed_files) as f64;
            let minutes = remaining / self.processing_rate;
            self.estimated_completion = Duration::try_from_secs_f64(minutes * 60.0)
                .ok()
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .and_then(|d| now.checked_add_signed(d));
        }

        let c = &mut self.compression;
        if c.original_bytes > 0 {
            c.compression_ratio = 1.0 - c.compressed_bytes as f64 / c.original_bytes as f64;
            c.space_saved = c.original_bytes.saturating_sub(c.compressed_bytes);
        }
    }
}

/// Totals accumulated over every finished run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BackupStatistics {
    pub total_jobs_run: u64,
    pub successful_jobs: u64,
    pub failed_jobs: u64,
    pub total_files_processed: u64,
    pub total_bytes_processed: u64,
    pub total_space_saved: u64,
    pub average_compression: f64,
    pub last_backup_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemState {
    pub active_jobs: Vec<String>,
    pub total_disk_usage: u64,
    pub available_disk_space: Option<u64>,
    pub last_health_check: DateTime<Utc>,
    #[serde(default)]
    pub backup_statistics: BackupStatistics,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            active_jobs: Vec::new(),
            total_disk_usage: 0,
            available_disk_space: None,
            last_health_check: Utc::now(),
            backup_statistics: BackupStatistics::default(),
        }
    }
}

/// What a finished run contributes to history
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSummary {
    pub succeeded: bool,
    pub files_processed: u64,
    pub original_bytes: u64,
    pub processed_bytes: u64,
    pub compression_ratio: f64,
    pub finished_at: DateTime<Utc>,
}

/// Aggregate over all stored progress snapshots
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProcessingStatistics {
    pub total_files_discovered: u64,
    pub total_files_processed: u64,
    pub total_errors: u64,
    pub total_original_bytes: u64,
    pub total_compressed_bytes: u64,
    pub total_processing_time_ms: u64,
    pub tracked_jobs: usize,
    pub compression_ratio: Option<f64>,
    pub space_saved_bytes: Option<u64>,
}

#[derive(Debug)]
pub struct StateStore {
    state_dir: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    /// Store rooted at `<data_dir>/state`
    pub fn new(data_dir: &Path) -> Self {
        Self {
            state_dir: data_dir.join("state"),
            lock: Mutex::new(()),
        }
    }

    fn progress_path(&self, id: &str) -> PathBuf {
        self.state_dir.join(format!("{}{}.json", PROGRESS_PREFIX, id))
    }

    fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StateStoreError> {
        let content = fs::read(path)?;
        serde_json::from_slice(&content).map_err(|source| StateStoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn load(&self, id: &str) -> Result<JobState, StateStoreError> {
        if !is_valid_id(id) {
            return Err(StateStoreError::NotFound(id.to_string()));
        }
        match Self::read_json(&self.progress_path(id)) {
            Err(StateStoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                Err(StateStoreError::NotFound(id.to_string()))
            }
            other => other,
        }
    }

    fn store(&self, state: &mut JobState) -> Result<(), StateStoreError> {
        if !is_valid_id(&state.id) {
            return Err(StateStoreError::NotFound(state.id.clone()));
        }
        state.recompute(Utc::now());
        write_json_atomic(&self.progress_path(&state.id), state)?;
        Ok(())
    }

    fn modify<F>(&self, id: &str, f: F) -> Result<JobState, StateStoreError>
    where
        F: FnOnce(&mut JobState),
    {
        let _guard = self.lock.lock();
        let mut state = self.load(id)?;
        f(&mut state);
        self.store(&mut state)?;
        Ok(state)
    }

    /// Recomputes derived fields on `state` and persists it
    pub fn save(&self, state: &mut JobState) -> Result<(), StateStoreError> {
        let _guard = self.lock.lock();
        self.store(state)
    }

    pub fn get(&self, id: &str) -> Result<JobState, StateStoreError> {
        let _guard = self.lock.lock();
        self.load(id)
    }

    /// Fresh running snapshot, replacing any leftover from an earlier run
    pub fn create(&self, id: &str) -> Result<JobState, StateStoreError> {
        let mut state = JobState::new(id);
        self.save(&mut state)?;
        Ok(state)
    }

    /// Removes the snapshot; a missing one is not an error
    pub fn delete(&self, id: &str) -> Result<(), StateStoreError> {
        let _guard = self.lock.lock();
        if !is_valid_id(id) {
            return Ok(());
        }
        match fs::remove_file(self.progress_path(id)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn progress_files(&self) -> Result<Vec<PathBuf>, StateStoreError> {
        if !self.state_dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.state_dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(PROGRESS_PREFIX) && name.ends_with(".json") && path.is_file() {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// All snapshots keyed by job id; unreadable files are skipped
    pub fn list_all(&self) -> Result<BTreeMap<String, JobState>, StateStoreError> {
        let _guard = self.lock.lock();
        let mut states = BTreeMap::new();
        for path in self.progress_files()? {
            match Self::read_json::<JobState>(&path) {
                Ok(state) => {
                    states.insert(state.id.clone(), state);
                }
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable state file"),
            }
        }
        Ok(states)
    }

    /// Records per-file progress and refreshes the files/minute rate.
    ///
    /// Creates the snapshot if the job has none yet.
    pub fn update_progress(
        &self,
        id: &str,
        processed_files: u64,
        total_files: u64,
        current_file: Option<&str>,
    ) -> Result<JobState, StateStoreError> {
        let _guard = self.lock.lock();
        let mut state = match self.load(id) {
            Ok(state) => state,
            Err(StateStoreError::NotFound(_)) => JobState::new(id),
            Err(e) => return Err(e),
        };

        state.processed_files = processed_files;
        state.total_files = total_files;
        state.current_file = current_file.map(str::to_string);

        let elapsed_minutes = (Utc::now() - state.start_time).num_milliseconds() as f64 / 60_000.0;
        if elapsed_minutes > 0.0 {
            state.processing_rate = processed_files as f64 / elapsed_minutes;
        }

        self.store(&mut state)?;
        Ok(state)
    }

    /// Sets the discovered totals once discovery has finished
    pub fn set_totals(&self, id: &str, total_files: u64, total_bytes: u64) -> Result<JobState, StateStoreError> {
        self.modify(id, |state| {
            state.total_files = total_files;
            state.total_bytes = total_bytes;
        })
    }

    /// Starts `phase`, closing whichever phase was still open
    pub fn add_phase_stats(&self, id: &str, phase: &str, files_count: u64) -> Result<JobState, StateStoreError> {
        self.modify(id, |state| {
            let now = Utc::now();
            for stats in state.phase_stats.values_mut() {
                stats.close(now);
            }
            state.phase_stats.insert(
                phase.to_string(),
                PhaseStats {
                    phase: phase.to_string(),
                    start_time: now,
                    end_time: None,
                    files_count,
                    elapsed_ms: 0,
                },
            );
            state.current_phase = Some(phase.to_string());
        })
    }

    /// Adds one file's sizes to the running compression totals
    pub fn update_compression_stats(
        &self,
        id: &str,
        original_bytes: u64,
        compressed_bytes: u64,
    ) -> Result<JobState, StateStoreError> {
        self.modify(id, |state| {
            state.compression.original_bytes += original_bytes;
            state.compression.compressed_bytes += compressed_bytes;
            state.processed_bytes += original_bytes;
        })
    }

    pub fn increment_error_count(&self, id: &str, message: &str) -> Result<JobState, StateStoreError> {
        self.modify(id, |state| {
            state.error_count += 1;
            state.last_error = Some(message.to_string());
        })
    }

    /// Sets the status; terminal statuses also close the open phase
    pub fn set_status(&self, id: &str, status: JobStatus) -> Result<JobState, StateStoreError> {
        self.modify(id, |state| {
            state.status = status;
            if status != JobStatus::Running && status != JobStatus::Pending {
                let now = Utc::now();
                for stats in state.phase_stats.values_mut() {
                    stats.close(now);
                }
                state.current_file = None;
            }
        })
    }

    /// Removes progress files not modified within `days`; returns how many
    pub fn cleanup_old_states(&self, days: u32) -> Result<usize, StateStoreError> {
        let _guard = self.lock.lock();
        let horizon = Duration::from_secs(u64::from(days) * 24 * 60 * 60);
        let cutoff = SystemTime::now().checked_sub(horizon).unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = 0;
        for path in self.progress_files()? {
            let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            if modified < cutoff {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale state"),
                }
            }
        }
        Ok(removed)
    }

    /// Stored system state, or a fresh default when none exists yet
    pub fn get_system_state(&self) -> Result<SystemState, StateStoreError> {
        let _guard = self.lock.lock();
        self.load_system_state()
    }

    fn load_system_state(&self) -> Result<SystemState, StateStoreError> {
        match Self::read_json(&self.state_dir.join(SYSTEM_STATE_FILE)) {
            Err(StateStoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(SystemState::default()),
            other => other,
        }
    }

    fn store_system_state(&self, state: &mut SystemState) -> Result<(), StateStoreError> {
        state.last_health_check = Utc::now();
        write_json_atomic(&self.state_dir.join(SYSTEM_STATE_FILE), state)?;
        Ok(())
    }

    pub fn save_system_state(&self, state: &mut SystemState) -> Result<(), StateStoreError> {
        let _guard = self.lock.lock();
        self.store_system_state(state)
    }

    /// Folds a finished run into the history totals
    pub fn record_run(&self, summary: &PipelineSummary) -> Result<BackupStatistics, StateStoreError> {
        let _guard = self.lock.lock();
        let mut system = self.load_system_state()?;
        let stats = &mut system.backup_statistics;

        stats.total_jobs_run += 1;
        if summary.succeeded {
            stats.successful_jobs += 1;
        } else {
            stats.failed_jobs += 1;
        }
        stats.total_files_processed += summary.files_processed;
        stats.total_bytes_processed += summary.original_bytes;
        stats.total_space_saved += summary.original_bytes.saturating_sub(summary.processed_bytes);

        let runs = stats.total_jobs_run as f64;
        stats.average_compression += (summary.compression_ratio - stats.average_compression) / runs;
        stats.last_backup_time = Some(summary.finished_at);

        let result = stats.clone();
        self.store_system_state(&mut system)?;
        Ok(result)
    }

    /// Totals over running and completed snapshots
    pub fn processing_statistics(&self) -> Result<ProcessingStatistics, StateStoreError> {
        let states = self.list_all()?;
        let mut stats = ProcessingStatistics {
            tracked_jobs: states.len(),
            ..Default::default()
        };

        for state in states.values() {
            if !matches!(state.status, JobStatus::Running | JobStatus::Completed) {
                continue;
            }
            stats.total_files_discovered += state.total_files;
            stats.total_files_processed += state.processed_files;
            stats.total_errors += state.error_count;
            stats.total_original_bytes += state.compression.original_bytes;
            stats.total_compressed_bytes += state.compression.compressed_bytes;
            stats.total_processing_time_ms += state.phase_stats.values().map(|p| p.elapsed_ms).sum::<u64>();
        }

        if stats.total_original_bytes > 0 {
            stats.compression_ratio =
                Some(1.0 - stats.total_compressed_bytes as f64 / stats.total_original_bytes as f64);
            stats.space_saved_bytes = Some(stats.total_original_bytes.saturating_sub(stats.total_compressed_bytes));
        }

        Ok(stats)
    }
}
