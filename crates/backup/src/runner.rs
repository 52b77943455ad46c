//! Backup service tying the job store, state store and pipeline together.
//!
//! Starting a job acquires its lock synchronously, then detaches the run onto
//! its own task. The caller gets a handle it may await or drop.

use crate::discovery::PatternFilter;
use crate::jobs::{BackupJob, JobStatistics, JobStatus, JobStore, JobStoreError, NewJob};
use crate::media::ToolPaths;
use crate::pipeline::{
    CancelCheck, Pipeline, PipelineError, PipelineOutcome, PipelineRequest, ProgressCallback,
    ProgressUpdate, RunStatus,
};
use crate::registry::{FileRegistry, ProcessingTimeStats, RegistryError, RegistryStats, REGISTRY_FILE};
use crate::space::SpaceStatus;
use crate::state::{
    BackupStatistics, JobState, PipelineSummary, ProcessingStatistics, StateStore, StateStoreError,
};
use crate::tiering::{TierAdjustment, TierStatistics};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tiered_backup_config::Config;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Jobs(#[from] JobStoreError),

    #[error(transparent)]
    State(#[from] StateStoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Invalid job: {0}")]
    Invalid(String),

    #[error("Job task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A job together with its live progress, if it is running
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job: BackupJob,
    pub state: Option<JobState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageStatus {
    pub space: SpaceStatus,
    pub tiers: TierStatistics,
    /// Adjustments that would bring usage back under the pressure threshold
    pub recommendations: Vec<TierAdjustment>,
}

/// Combined view over the registry, run history and tier catalog
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatistics {
    pub registry: RegistryStats,
    pub processing_time: ProcessingTimeStats,
    pub compression_by_extension: BTreeMap<String, f64>,
    pub processing: ProcessingStatistics,
    pub history: BackupStatistics,
    pub tiers: TierStatistics,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub jobs_archived: usize,
    pub orphaned_locks: usize,
    pub registry_entries: usize,
    pub stale_states: usize,
}

/// Job submission interface over the stores and the pipeline
pub struct BackupService {
    config: Arc<Config>,
    jobs: Arc<JobStore>,
    state: Arc<StateStore>,
    registry: Arc<FileRegistry>,
    pipeline: Arc<Pipeline>,
    /// In-process cancel flags of running jobs
    cancel_flags: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
}

impl BackupService {
    /// Opens the stores under `config.data_dir` and discovers tools on `PATH`
    pub fn new(config: Arc<Config>) -> Result<Self, RunnerError> {
        let (registry, state) = Self::open_stores(&config)?;
        let pipeline = Pipeline::new(config.clone(), registry.clone(), state.clone())?;
        Ok(Self::assemble(config, registry, state, pipeline))
    }

    /// Like [`new`](Self::new) with explicit tool locations
    pub fn with_tools(config: Arc<Config>, tools: ToolPaths) -> Result<Self, RunnerError> {
        let (registry, state) = Self::open_stores(&config)?;
        let pipeline = Pipeline::with_tools(config.clone(), registry.clone(), state.clone(), tools)?;
        Ok(Self::assemble(config, registry, state, pipeline))
    }

    fn open_stores(config: &Config) -> Result<(Arc<FileRegistry>, Arc<StateStore>), RunnerError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let registry = FileRegistry::open(config.data_dir.join("state").join(REGISTRY_FILE))?;
        Ok((Arc::new(registry), Arc::new(StateStore::new(&config.data_dir))))
    }

    fn assemble(
        config: Arc<Config>,
        registry: Arc<FileRegistry>,
        state: Arc<StateStore>,
        pipeline: Pipeline,
    ) -> Self {
        Self {
            jobs: Arc::new(JobStore::new(&config.data_dir)),
            config,
            state,
            registry,
            pipeline: Arc::new(pipeline),
            cancel_flags: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    /// Validates patterns and stores a new pending job
    pub fn create_job(&self, new_job: NewJob) -> Result<BackupJob, RunnerError> {
        PatternFilter::new(&new_job.include_patterns, &new_job.exclude_patterns)
            .map_err(|e| RunnerError::Invalid(e.to_string()))?;
        if new_job.source_path == new_job.destination_path && !new_job.source_path.as_os_str().is_empty() {
            return Err(RunnerError::Invalid(
                "source and destination must differ".to_string(),
            ));
        }
        Ok(self.jobs.create(new_job)?)
    }

    pub fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<BackupJob>, RunnerError> {
        Ok(match status {
            Some(status) => self.jobs.list_by_status(status)?,
            None => self.jobs.list()?,
        })
    }

    /// Marks the job running and detaches its run.
    ///
    /// Lifecycle violations (not pending, already locked) are returned here,
    /// before anything is spawned.
    pub fn start_job(&self, id: &str) -> Result<JoinHandle<Result<PipelineOutcome, RunnerError>>, RunnerError> {
        let job = self.jobs.start(id)?;

        if let Err(e) = self.state.create(&job.id) {
            warn!(job_id = %job.id, error = %e, "Failed to create progress state");
        }

        let flag = Arc::new(AtomicBool::new(false));
        self.cancel_flags.lock().insert(job.id.clone(), flag.clone());

        let run = JobRun {
            jobs: self.jobs.clone(),
            state: self.state.clone(),
            pipeline: self.pipeline.clone(),
            cancel_flags: self.cancel_flags.clone(),
            flag,
        };
        Ok(tokio::spawn(run.execute(job)))
    }

    /// Starts the job and waits for it to finish
    pub async fn run_job(&self, id: &str) -> Result<PipelineOutcome, RunnerError> {
        self.start_job(id)?.await?
    }

    /// Stops dispatching new files; the file in flight finishes
    pub fn cancel_job(&self, id: &str) -> Result<BackupJob, RunnerError> {
        let job = self.jobs.cancel(id)?;
        if let Some(flag) = self.cancel_flags.lock().get(id) {
            flag.store(true, Ordering::Relaxed);
        }
        match self.state.set_status(id, JobStatus::Canceled) {
            Ok(_) | Err(StateStoreError::NotFound(_)) => {}
            Err(e) => warn!(job_id = %id, error = %e, "Failed to update progress state"),
        }
        Ok(job)
    }

    pub fn delete_job(&self, id: &str) -> Result<(), RunnerError> {
        self.jobs.delete(id)?;
        self.state.delete(id)?;
        Ok(())
    }

    pub fn job_status(&self, id: &str) -> Result<JobStatusView, RunnerError> {
        let job = self.jobs.get(id)?;
        let state = match self.state.get(id) {
            Ok(state) => Some(state),
            Err(StateStoreError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        Ok(JobStatusView { job, state })
    }

    pub fn storage_status(&self) -> StorageStatus {
        let tiering = self.pipeline.tiering();
        tiering.update_space_usage();
        let threshold_percent = self.config.processing.space_pressure_threshold * 100.0;
        StorageStatus {
            space: tiering.monitor().status(),
            tiers: tiering.statistics(),
            recommendations: tiering.recommend_adjustments(threshold_percent),
        }
    }

    pub fn statistics(&self) -> Result<ServiceStatistics, RunnerError> {
        Ok(ServiceStatistics {
            registry: self.registry.stats(),
            processing_time: self.registry.processing_time_stats(),
            compression_by_extension: self.registry.compression_by_extension(),
            processing: self.state.processing_statistics()?,
            history: self.state.get_system_state()?.backup_statistics,
            tiers: self.pipeline.tiering().statistics(),
        })
    }

    /// Applies the configured retention horizon to every store
    pub fn cleanup(&self) -> Result<CleanupReport, RunnerError> {
        let days = self.config.retention_days;
        let report = CleanupReport {
            jobs_archived: self.jobs.cleanup_old_jobs(days)?,
            orphaned_locks: self.jobs.cleanup_orphaned_locks()?,
            registry_entries: self.registry.cleanup_older_than(days)?,
            stale_states: self.state.cleanup_old_states(days)?,
        };
        info!(
            jobs = report.jobs_archived,
            locks = report.orphaned_locks,
            registry = report.registry_entries,
            states = report.stale_states,
            "Cleanup finished"
        );
        Ok(report)
    }
}

/// Everything a detached run owns
struct JobRun {
    jobs: Arc<JobStore>,
    state: Arc<StateStore>,
    pipeline: Arc<Pipeline>,
    cancel_flags: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
    flag: Arc<AtomicBool>,
}

fn progress_statistics(update: &ProgressUpdate) -> JobStatistics {
    JobStatistics {
        total_files: update.total_files,
        processed_files: update.processed_files,
        failed_files: update.errors.len() as u64,
        skipped_files: 0,
        total_size_bytes: update.total_bytes,
        processed_size_bytes: update.processed_bytes,
        compression_ratio: 0.0,
        processing_time_ms: update.elapsed.as_millis() as u64,
        last_updated: None,
    }
}

fn outcome_statistics(outcome: &PipelineOutcome) -> JobStatistics {
    JobStatistics {
        total_files: outcome.total_files,
        processed_files: outcome.processed_files,
        failed_files: outcome.failed_files,
        skipped_files: outcome.skipped_files,
        total_size_bytes: outcome.total_original_bytes,
        processed_size_bytes: outcome.total_processed_bytes,
        compression_ratio: outcome.compression_ratio,
        processing_time_ms: outcome.elapsed.as_millis() as u64,
        last_updated: None,
    }
}

impl JobRun {
    async fn execute(self, job: BackupJob) -> Result<PipelineOutcome, RunnerError> {
        let id = job.id.clone();
        info!(job_id = %id, name = %job.name, "Job run started");

        let jobs = self.jobs.clone();
        let progress_id = id.clone();
        let progress: ProgressCallback = Arc::new(move |update: &ProgressUpdate| {
            if let Err(e) = jobs.update_statistics(&progress_id, progress_statistics(update)) {
                warn!(job_id = %progress_id, error = %e, "Failed to store job statistics");
            }
        });

        let jobs = self.jobs.clone();
        let flag = self.flag.clone();
        let cancel_id = id.clone();
        let cancel: CancelCheck = Arc::new(move || {
            flag.load(Ordering::Relaxed)
                || matches!(jobs.get(&cancel_id).map(|j| j.status), Ok(JobStatus::Canceled))
        });

        let request = PipelineRequest {
            job_id: id.clone(),
            source: job.source_path.clone(),
            destination: job.destination_path.clone(),
            include: job.include_patterns.clone(),
            exclude: job.exclude_patterns.clone(),
            max_concurrency: job.settings.max_concurrency,
            verify_checksums: job.settings.verify_checksums,
            delete_originals: job.settings.delete_originals,
            progress: Some(progress),
            cancel: Some(cancel),
        };

        let result = self.pipeline.run(request).await;
        let finished = self.finish(&id, &result);
        self.cancel_flags.lock().remove(&id);

        finished?;
        Ok(result?)
    }

    /// Terminal bookkeeping: job status, history, progress state
    fn finish(&self, id: &str, result: &Result<PipelineOutcome, PipelineError>) -> Result<(), RunnerError> {
        let summary = match result {
            Ok(outcome) => {
                if let Err(e) = self.jobs.update_statistics(id, outcome_statistics(outcome)) {
                    warn!(job_id = %id, error = %e, "Failed to store final job statistics");
                }
                let success = outcome.status != RunStatus::Failed;
                let message = outcome.error_message();
                let job = self.jobs.complete(id, success, message.as_deref())?;
                info!(job_id = %id, status = %job.status, run_status = %outcome.status, "Job run finished");
                outcome.summary()
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "Job run failed");
                self.jobs.complete(id, false, Some(&e.to_string()))?;
                PipelineSummary {
                    succeeded: false,
                    files_processed: 0,
                    original_bytes: 0,
                    processed_bytes: 0,
                    compression_ratio: 0.0,
                    finished_at: Utc::now(),
                }
            }
        };

        if let Err(e) = self.state.record_run(&summary) {
            warn!(job_id = %id, error = %e, "Failed to record run history");
        }
        if let Err(e) = self.state.delete(id) {
            warn!(job_id = %id, error = %e, "Failed to clear progress state");
        }
        Ok(())
    }
}
