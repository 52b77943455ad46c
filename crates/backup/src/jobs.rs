//! Job store for persisting and managing backup jobs.
//!
//! Jobs are persisted as JSON files under `<data_dir>/jobs`. A running job
//! owns `jobs/active/<id>.lock`, created with create-if-absent semantics so
//! two concurrent starts cannot both succeed. Deleted jobs are moved to
//! `jobs/completed/` rather than removed.

use crate::atomic::write_json_atomic;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_MAX_CONCURRENCY: u32 = 2;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting to be started.
    Pending,
    /// Job is currently running.
    Running,
    /// Job finished; individual files may still have failed.
    Completed,
    /// Job could not run or nothing could be processed.
    Failed,
    /// Job was canceled while running.
    Canceled,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "canceled" | "cancelled" => Ok(JobStatus::Canceled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Per-job knobs.
///
/// The pipeline acts on `max_concurrency`, `delete_originals` and
/// `verify_checksums`. The remaining fields are stored with the job
/// definition for callers and are not read by the run itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobSettings {
    /// Worker count for a run; 0 uses the configured default
    #[serde(default)]
    pub max_concurrency: u32,
    /// Stored only; a failed file is retried by the next run
    #[serde(default)]
    pub retry_attempts: u32,
    #[serde(default)]
    pub delete_originals: bool,
    #[serde(default)]
    pub verify_checksums: bool,
    /// Stored only
    #[serde(default)]
    pub notify_on_completion: bool,
    /// Stored only
    #[serde(default)]
    pub notify_on_error: bool,
    /// Stored only; space pressure always follows the global storage limit
    #[serde(default)]
    pub space_limit_gb: u64,
    /// Stored only; space pressure adjusts every job's tiers
    #[serde(default)]
    pub quality_adjustment: bool,
}

/// Counters from the most recent run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobStatistics {
    pub total_files: u64,
    pub processed_files: u64,
    pub failed_files: u64,
    pub skipped_files: u64,
    pub total_size_bytes: u64,
    pub processed_size_bytes: u64,
    pub compression_ratio: f64,
    pub processing_time_ms: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

/// A named, durable backup run definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupJob {
    /// Unique job identifier (UUID).
    pub id: String,
    pub name: String,
    pub status: JobStatus,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub settings: JobSettings,
    #[serde(default)]
    pub statistics: JobStatistics,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Joined error text from the last run, if any
    pub error_message: Option<String>,
}

impl BackupJob {
    /// Check if the job is in a terminal state (completed, failed, or canceled).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Check if the job is active (pending or running).
    pub fn is_active(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Running)
    }
}

/// Input for [`JobStore::create`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewJob {
    pub name: String,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub settings: JobSettings,
}

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid job: {0}")]
    Invalid(String),

    #[error("Job {id} is not pending (current: {status})")]
    NotPending { id: String, status: JobStatus },

    #[error("Job {id} is not running (current: {status})")]
    NotRunning { id: String, status: JobStatus },

    #[error("Job {0} is already running")]
    AlreadyRunning(String),

    #[error("Failed to parse job file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Job store IO error: {0}")]
    Io(#[from] io::Error),
}

/// Ids become file names, so only a conservative character set is accepted
pub(crate) fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// File-backed job definitions and lifecycle
#[derive(Debug)]
pub struct JobStore {
    jobs_dir: PathBuf,
    /// Serializes read-modify-write of job files
    lifecycle: Mutex<()>,
}

impl JobStore {
    /// Opens the store rooted at `<data_dir>/jobs`
    pub fn new(data_dir: &Path) -> Self {
        Self {
            jobs_dir: data_dir.join("jobs"),
            lifecycle: Mutex::new(()),
        }
    }

    fn job_path(&self, id: &str) -> PathBuf {
        self.jobs_dir.join(format!("{}.json", id))
    }

    fn active_dir(&self) -> PathBuf {
        self.jobs_dir.join("active")
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.active_dir().join(format!("{}.lock", id))
    }

    fn completed_dir(&self) -> PathBuf {
        self.jobs_dir.join("completed")
    }

    fn save(&self, job: &BackupJob) -> Result<(), JobStoreError> {
        write_json_atomic(&self.job_path(&job.id), job)?;
        Ok(())
    }

    fn load(&self, path: &Path) -> Result<BackupJob, JobStoreError> {
        let content = fs::read(path)?;
        serde_json::from_slice(&content).map_err(|source| JobStoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Creates a pending job with a fresh id and default settings filled in
    pub fn create(&self, new_job: NewJob) -> Result<BackupJob, JobStoreError> {
        if new_job.name.trim().is_empty() {
            return Err(JobStoreError::Invalid("name cannot be empty".to_string()));
        }
        if new_job.source_path.as_os_str().is_empty() {
            return Err(JobStoreError::Invalid("source path cannot be empty".to_string()));
        }
        if new_job.destination_path.as_os_str().is_empty() {
            return Err(JobStoreError::Invalid("destination path cannot be empty".to_string()));
        }

        let mut settings = new_job.settings;
        if settings.max_concurrency == 0 {
            settings.max_concurrency = DEFAULT_MAX_CONCURRENCY;
        }
        if settings.retry_attempts == 0 {
            settings.retry_attempts = DEFAULT_RETRY_ATTEMPTS;
        }

        let now = Utc::now();
        let job = BackupJob {
            id: Uuid::new_v4().to_string(),
            name: new_job.name,
            status: JobStatus::Pending,
            source_path: new_job.source_path,
            destination_path: new_job.destination_path,
            include_patterns: new_job.include_patterns,
            exclude_patterns: new_job.exclude_patterns,
            settings,
            statistics: JobStatistics {
                last_updated: Some(now),
                ..Default::default()
            },
            created_at: now,
            started_at: None,
            completed_at: None,
            last_run_at: None,
            error_message: None,
        };

        self.save(&job)?;
        info!(job_id = %job.id, name = %job.name, "Job created");
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Result<BackupJob, JobStoreError> {
        if !is_valid_id(id) {
            return Err(JobStoreError::NotFound(id.to_string()));
        }
        let path = self.job_path(id);
        match self.load(&path) {
            Err(JobStoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                Err(JobStoreError::NotFound(id.to_string()))
            }
            other => other,
        }
    }

    /// Persists `job` as-is, refreshing its statistics timestamp
    pub fn update(&self, job: &BackupJob) -> Result<(), JobStoreError> {
        if !is_valid_id(&job.id) {
            return Err(JobStoreError::Invalid(format!("bad job id '{}'", job.id)));
        }
        let _guard = self.lifecycle.lock();
        let mut job = job.clone();
        job.statistics.last_updated = Some(Utc::now());
        self.save(&job)
    }

    /// Replaces only the statistics of a stored job
    pub fn update_statistics(&self, id: &str, mut stats: JobStatistics) -> Result<(), JobStoreError> {
        let _guard = self.lifecycle.lock();
        let mut job = self.get(id)?;
        stats.last_updated = Some(Utc::now());
        job.statistics = stats;
        self.save(&job)
    }

    /// Moves the job definition to the completed archive
    pub fn delete(&self, id: &str) -> Result<(), JobStoreError> {
        let _guard = self.lifecycle.lock();
        self.get(id)?;
        if self.is_running(id) {
            return Err(JobStoreError::AlreadyRunning(id.to_string()));
        }
        self.archive(id)
    }

    fn archive(&self, id: &str) -> Result<(), JobStoreError> {
        let from = self.job_path(id);
        let completed = self.completed_dir();
        fs::create_dir_all(&completed)?;
        if let Err(e) = fs::rename(&from, completed.join(format!("{}.json", id))) {
            warn!(job_id = %id, error = %e, "Failed to archive job, removing it instead");
            fs::remove_file(&from)?;
        }
        info!(job_id = %id, "Job deleted");
        Ok(())
    }

    /// All job definitions, oldest first. Unreadable files are skipped.
    pub fn list(&self) -> Result<Vec<BackupJob>, JobStoreError> {
        if !self.jobs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut jobs = Vec::new();
        for entry in fs::read_dir(&self.jobs_dir)? {
            let path = entry?.path();

            // Only process .json files
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match self.load(&path) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable job file"),
            }
        }

        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    pub fn list_by_status(&self, status: JobStatus) -> Result<Vec<BackupJob>, JobStoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|job| job.status == status)
            .collect())
    }

    /// Pending -> running. The lock file is the guard.
    pub fn start(&self, id: &str) -> Result<BackupJob, JobStoreError> {
        let _guard = self.lifecycle.lock();
        let mut job = self.get(id)?;

        if job.status != JobStatus::Pending {
            return Err(JobStoreError::NotPending {
                id: id.to_string(),
                status: job.status,
            });
        }

        let lock_path = self.lock_path(id);
        fs::create_dir_all(self.active_dir())?;
        let mut lock = match fs::OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(JobStoreError::AlreadyRunning(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let now = Utc::now();
        if let Err(e) = lock.write_all(now.to_rfc3339().as_bytes()) {
            let _ = fs::remove_file(&lock_path);
            return Err(e.into());
        }

        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.last_run_at = Some(now);
        job.completed_at = None;
        job.error_message = None;

        if let Err(e) = self.save(&job) {
            let _ = fs::remove_file(&lock_path);
            return Err(e);
        }

        info!(job_id = %id, "Job started");
        Ok(job)
    }

    /// Running -> completed/failed, releasing the lock.
    ///
    /// A job canceled in the meantime stays canceled.
    pub fn complete(&self, id: &str, success: bool, message: Option<&str>) -> Result<BackupJob, JobStoreError> {
        let _guard = self.lifecycle.lock();
        let mut job = self.get(id)?;
        let now = Utc::now();

        if job.status == JobStatus::Canceled {
            job.completed_at.get_or_insert(now);
        } else {
            job.status = if success {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            };
            job.error_message = message.map(str::to_string);
            job.completed_at = Some(now);
        }

        self.save(&job)?;
        self.release_lock(id);
        info!(job_id = %id, status = %job.status, "Job finished");
        Ok(job)
    }

    /// Running -> canceled, releasing the lock. In-flight files finish on their own.
    pub fn cancel(&self, id: &str) -> Result<BackupJob, JobStoreError> {
        let _guard = self.lifecycle.lock();
        let mut job = self.get(id)?;

        if job.status != JobStatus::Running {
            return Err(JobStoreError::NotRunning {
                id: id.to_string(),
                status: job.status,
            });
        }

        job.status = JobStatus::Canceled;
        job.completed_at = Some(Utc::now());
        self.save(&job)?;
        self.release_lock(id);
        info!(job_id = %id, "Job canceled");
        Ok(job)
    }

    fn release_lock(&self, id: &str) {
        if let Err(e) = fs::remove_file(self.lock_path(id)) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(job_id = %id, error = %e, "Failed to remove job lock");
            }
        }
    }

    pub fn is_running(&self, id: &str) -> bool {
        is_valid_id(id) && self.lock_path(id).exists()
    }

    fn lock_ids(&self) -> Result<Vec<String>, JobStoreError> {
        let pattern = format!(
            "{}/*.lock",
            glob::Pattern::escape(&self.active_dir().to_string_lossy())
        );
        let paths = glob::glob(&pattern)
            .map_err(|e| JobStoreError::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        Ok(paths
            .filter_map(Result::ok)
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(String::from))
            .collect())
    }

    /// Jobs holding a run lock; locks without a job are ignored
    pub fn list_running(&self) -> Result<Vec<BackupJob>, JobStoreError> {
        Ok(self
            .lock_ids()?
            .iter()
            .filter_map(|id| self.get(id).ok())
            .collect())
    }

    /// Archives completed and failed jobs older than `days`; returns how many
    pub fn cleanup_old_jobs(&self, days: u32) -> Result<usize, JobStoreError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let mut removed = 0;

        for job in self.list()? {
            if !matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
                continue;
            }
            let finished = job.completed_at.unwrap_or(job.created_at);
            if finished < cutoff {
                let _guard = self.lifecycle.lock();
                match self.archive(&job.id) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(job_id = %job.id, error = %e, "Failed to clean up job"),
                }
            }
        }
        Ok(removed)
    }

    /// Removes lock files whose job definition no longer exists
    pub fn cleanup_orphaned_locks(&self) -> Result<usize, JobStoreError> {
        let mut removed = 0;
        for id in self.lock_ids()? {
            if let Err(JobStoreError::NotFound(_)) = self.get(&id) {
                fs::remove_file(self.lock_path(&id))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn new_job(name: &str) -> NewJob {
        NewJob {
            name: name.to_string(),
            source_path: PathBuf::from("/media/photos"),
            destination_path: PathBuf::from("/backup/photos"),
            include_patterns: vec!["*.jpg".to_string()],
            exclude_patterns: vec![],
            settings: JobSettings::default(),
        }
    }

    #[test]
    fn test_job_status_display() {
        assert_eq!(JobStatus::Pending.to_string(), "pending");
        assert_eq!(JobStatus::Running.to_string(), "running");
        assert_eq!(JobStatus::Completed.to_string(), "completed");
        assert_eq!(JobStatus::Failed.to_string(), "failed");
        assert_eq!(JobStatus::Canceled.to_string(), "canceled");
        assert_eq!("Cancelled".parse::<JobStatus>(), Ok(JobStatus::Canceled));
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_job_status_default() {
        assert_eq!(JobStatus::default(), JobStatus::Pending);
    }

    #[test]
    fn test_create_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path());

        let job = store.create(new_job("Photos")).unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.settings.max_concurrency, 2);
        assert_eq!(job.settings.retry_attempts, 3);
        assert!(Uuid::parse_str(&job.id).is_ok());
        assert!(dir.path().join("jobs").join(format!("{}.json", job.id)).exists());
        assert_eq!(store.get(&job.id).unwrap(), job);
    }

    #[test]
    fn test_create_rejects_empty_fields() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path());

        assert!(matches!(store.create(new_job("  ")), Err(JobStoreError::Invalid(_))));

        let mut missing_dest = new_job("x");
        missing_dest.destination_path = PathBuf::new();
        assert!(matches!(store.create(missing_dest), Err(JobStoreError::Invalid(_))));
    }

    #[test]
    fn test_stored_settings_survive_reload() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path());

        let mut input = new_job("kept");
        input.settings = JobSettings {
            retry_attempts: 5,
            notify_on_completion: true,
            notify_on_error: true,
            space_limit_gb: 250,
            quality_adjustment: true,
            ..Default::default()
        };
        let job = store.create(input).unwrap();

        let settings = JobStore::new(dir.path()).get(&job.id).unwrap().settings;
        assert_eq!(settings.retry_attempts, 5);
        assert!(settings.notify_on_completion);
        assert!(settings.notify_on_error);
        assert_eq!(settings.space_limit_gb, 250);
        assert!(settings.quality_adjustment);
        assert_eq!(settings.max_concurrency, DEFAULT_MAX_CONCURRENCY);
    }

    #[test]
    fn test_get_unknown_and_bad_ids() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path());
        assert!(matches!(store.get("missing"), Err(JobStoreError::NotFound(_))));
        assert!(matches!(store.get("../etc/passwd"), Err(JobStoreError::NotFound(_))));
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path());
        let job = store.create(new_job("Twice")).unwrap();

        let started = store.start(&job.id).unwrap();
        assert_eq!(started.status, JobStatus::Running);
        assert!(started.started_at.is_some());
        assert!(store.is_running(&job.id));

        match store.start(&job.id) {
            Err(JobStoreError::NotPending { status, .. }) => assert_eq!(status, JobStatus::Running),
            other => panic!("expected NotPending, got {:?}", other),
        }

        let locks: Vec<_> = fs::read_dir(dir.path().join("jobs").join("active")).unwrap().collect();
        assert_eq!(locks.len(), 1);
        assert_eq!(store.list_running().unwrap().len(), 1);
    }

    #[test]
    fn test_existing_lock_blocks_start() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path());
        let job = store.create(new_job("Stale")).unwrap();

        let active = dir.path().join("jobs").join("active");
        fs::create_dir_all(&active).unwrap();
        fs::write(active.join(format!("{}.lock", job.id)), b"x").unwrap();

        assert!(matches!(store.start(&job.id), Err(JobStoreError::AlreadyRunning(_))));
        assert_eq!(store.get(&job.id).unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn test_concurrent_starts_only_one_wins() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(JobStore::new(dir.path()));
        let job = store.create(new_job("Race")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let id = job.id.clone();
                std::thread::spawn(move || store.start(&id).is_ok())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|started| *started)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn test_complete_and_cancel() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path());

        let ok = store.create(new_job("ok")).unwrap();
        store.start(&ok.id).unwrap();
        let done = store.complete(&ok.id, true, Some("2 files failed")).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.error_message.as_deref(), Some("2 files failed"));
        assert!(done.completed_at.is_some());
        assert!(!store.is_running(&ok.id));

        let bad = store.create(new_job("bad")).unwrap();
        store.start(&bad.id).unwrap();
        let failed = store.complete(&bad.id, false, Some("source unreadable")).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);

        // Cancel only while running
        assert!(matches!(store.cancel(&bad.id), Err(JobStoreError::NotRunning { .. })));

        let canceled = store.create(new_job("stop")).unwrap();
        store.start(&canceled.id).unwrap();
        assert_eq!(store.cancel(&canceled.id).unwrap().status, JobStatus::Canceled);
        assert!(!store.is_running(&canceled.id));

        // Completion after cancel keeps the cancellation
        let after = store.complete(&canceled.id, true, None).unwrap();
        assert_eq!(after.status, JobStatus::Canceled);
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_completion_keeps_lock() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path());
        let job = store.create(new_job("readonly")).unwrap();
        store.start(&job.id).unwrap();

        let jobs_dir = dir.path().join("jobs");
        fs::set_permissions(&jobs_dir, fs::Permissions::from_mode(0o555)).unwrap();
        // Permission bits do not bind a privileged user
        let writable = fs::write(jobs_dir.join("write-check"), b"").is_ok();
        if !writable {
            assert!(store.complete(&job.id, true, None).is_err());
            assert!(store.cancel(&job.id).is_err());
        }
        fs::set_permissions(&jobs_dir, fs::Permissions::from_mode(0o755)).unwrap();
        if writable {
            return;
        }

        assert!(store.is_running(&job.id));
        assert_eq!(store.get(&job.id).unwrap().status, JobStatus::Running);
        assert_eq!(store.complete(&job.id, true, None).unwrap().status, JobStatus::Completed);
        assert!(!store.is_running(&job.id));
    }

    #[test]
    fn test_update_statistics() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path());
        let job = store.create(new_job("stats")).unwrap();

        store
            .update_statistics(
                &job.id,
                JobStatistics {
                    total_files: 10,
                    processed_files: 4,
                    ..Default::default()
                },
            )
            .unwrap();

        let stored = store.get(&job.id).unwrap();
        assert_eq!(stored.statistics.total_files, 10);
        assert_eq!(stored.statistics.processed_files, 4);
        assert!(stored.statistics.last_updated.is_some());
    }

    #[test]
    fn test_delete_archives_job() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path());
        let job = store.create(new_job("gone")).unwrap();

        store.delete(&job.id).unwrap();

        assert!(matches!(store.get(&job.id), Err(JobStoreError::NotFound(_))));
        assert!(dir
            .path()
            .join("jobs")
            .join("completed")
            .join(format!("{}.json", job.id))
            .exists());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_delete_running_job_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path());
        let job = store.create(new_job("busy")).unwrap();
        store.start(&job.id).unwrap();

        assert!(matches!(store.delete(&job.id), Err(JobStoreError::AlreadyRunning(_))));
    }

    #[test]
    fn test_list_skips_corrupt_files_and_filters() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path());
        let a = store.create(new_job("a")).unwrap();
        store.create(new_job("b")).unwrap();
        fs::write(dir.path().join("jobs").join("garbage.json"), b"{").unwrap();
        fs::write(dir.path().join("jobs").join("notes.txt"), b"hello").unwrap();

        assert_eq!(store.list().unwrap().len(), 2);

        store.start(&a.id).unwrap();
        assert_eq!(store.list_by_status(JobStatus::Running).unwrap().len(), 1);
        assert_eq!(store.list_by_status(JobStatus::Pending).unwrap().len(), 1);
    }

    #[test]
    fn test_list_nonexistent_dir() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(&dir.path().join("nope"));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_cleanup_old_jobs() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path());

        let old = store.create(new_job("old")).unwrap();
        store.start(&old.id).unwrap();
        let mut old = store.complete(&old.id, true, None).unwrap();
        old.completed_at = Some(Utc::now() - chrono::Duration::days(60));
        store.update(&old).unwrap();

        let recent = store.create(new_job("recent")).unwrap();
        store.start(&recent.id).unwrap();
        store.complete(&recent.id, false, Some("x")).unwrap();

        let pending = store.create(new_job("pending")).unwrap();

        assert_eq!(store.cleanup_old_jobs(30).unwrap(), 1);
        assert!(store.get(&old.id).is_err());
        assert!(store.get(&recent.id).is_ok());
        assert!(store.get(&pending.id).is_ok());
    }

    #[test]
    fn test_cleanup_orphaned_locks() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path());
        let job = store.create(new_job("live")).unwrap();
        store.start(&job.id).unwrap();

        let active = dir.path().join("jobs").join("active");
        fs::write(active.join("ghost.lock"), b"x").unwrap();

        assert_eq!(store.cleanup_orphaned_locks().unwrap(), 1);
        assert!(store.is_running(&job.id));
        assert!(!active.join("ghost.lock").exists());
    }

    fn job_status_strategy() -> impl Strategy<Value = JobStatus> {
        prop_oneof![
            Just(JobStatus::Pending),
            Just(JobStatus::Running),
            Just(JobStatus::Completed),
            Just(JobStatus::Failed),
            Just(JobStatus::Canceled),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        // Only a pending job can be started; anything else is rejected
        // without touching the stored record or creating a lock.
        #[test]
        fn prop_start_requires_pending(status in job_status_strategy()) {
            let dir = TempDir::new().unwrap();
            let store = JobStore::new(dir.path());
            let mut job = store.create(new_job("p")).unwrap();
            job.status = status;
            store.update(&job).unwrap();

            let result = store.start(&job.id);
            if status == JobStatus::Pending {
                prop_assert!(result.is_ok());
                prop_assert!(store.is_running(&job.id));
            } else {
                let is_not_pending = matches!(result, Err(JobStoreError::NotPending { .. }));
                prop_assert!(is_not_pending);
                prop_assert!(!store.is_running(&job.id));
                prop_assert_eq!(store.get(&job.id).unwrap().status, status);
            }
        }
    }
}
