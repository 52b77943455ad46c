//! Processing pipeline for one backup run.
//!
//! A run goes Discovery -> Processing -> (Completed | CompletedWithErrors | Failed).
//! Discovery enumerates the whole backlog first; processing then fans the
//! files out to a bounded pool of tokio workers pulling from a closed channel.
//! Individual file failures are counted and reported, never fatal to the run.

use crate::concurrency::WorkerPlan;
use crate::discovery::{discover_files, DiscoveredFile, DiscoveryError, PatternFilter};
use crate::media::{
    MediaKind, MediaTransformer, PhotoTransformer, ProcessingResult, ToolPaths, TransformAction,
    VideoTransformer,
};
use crate::registry::{hash_file, FileRegistry, ProcessedFileRecord, RecordStatus};
use crate::state::{PipelineSummary, StateStore, StateStoreError};
use crate::tiering::TieringEngine;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tiered_backup_config::{Config, ValidationErrors};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Estimated cost of one photo when sizing a run
const PHOTO_ESTIMATE: Duration = Duration::from_millis(100);
/// Estimated cost of one megabyte of video
const VIDEO_ESTIMATE_PER_MB: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ValidationErrors),

    #[error("Worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Discovery,
    Processing,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Discovery => "discovery",
            Phase::Processing => "processing",
        }
    }
}

/// Snapshot handed to the progress callback after every file.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub phase: Phase,
    pub current_file: Option<PathBuf>,
    /// Files handled so far, whatever their outcome
    pub processed_files: u64,
    pub total_files: u64,
    pub processed_bytes: u64,
    pub total_bytes: u64,
    pub elapsed: Duration,
    /// Files per minute
    pub rate: f64,
    pub estimated_remaining: Option<Duration>,
    pub errors: Vec<String>,
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Polled before each file is dequeued; `true` stops the run
pub type CancelCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Parameters of a single run.
#[derive(Clone, Default)]
pub struct PipelineRequest {
    pub job_id: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// 0 falls back to the configured default
    pub max_concurrency: u32,
    pub verify_checksums: bool,
    pub delete_originals: bool,
    pub progress: Option<ProgressCallback>,
    pub cancel: Option<CancelCheck>,
}

impl std::fmt::Debug for PipelineRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRequest")
            .field("job_id", &self.job_id)
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("include", &self.include)
            .field("exclude", &self.exclude)
            .field("max_concurrency", &self.max_concurrency)
            .field("verify_checksums", &self.verify_checksums)
            .field("delete_originals", &self.delete_originals)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every file was archived or already present
    Completed,
    /// Some files failed, at least one was archived or already present
    CompletedWithErrors,
    /// Nothing could be archived
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::CompletedWithErrors => write!(f, "completed_with_errors"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineOutcome {
    pub job_id: String,
    pub status: RunStatus,
    pub total_files: u64,
    /// Files archived during this run
    pub processed_files: u64,
    /// Files whose content was already archived
    pub skipped_files: u64,
    pub failed_files: u64,
    pub canceled: bool,
    pub total_original_bytes: u64,
    pub total_processed_bytes: u64,
    pub compression_ratio: f64,
    pub elapsed: Duration,
    pub errors: Vec<String>,
}

impl PipelineOutcome {
    /// All file errors joined for the job record
    pub fn error_message(&self) -> Option<String> {
        if self.errors.is_empty() {
            None
        } else {
            Some(self.errors.join("; "))
        }
    }

    pub fn summary(&self) -> PipelineSummary {
        PipelineSummary {
            succeeded: self.status != RunStatus::Failed,
            files_processed: self.processed_files,
            original_bytes: self.total_original_bytes,
            processed_bytes: self.total_processed_bytes,
            compression_ratio: self.compression_ratio,
            finished_at: Utc::now(),
        }
    }
}

fn run_status(archived: u64, skipped: u64, failed: u64) -> RunStatus {
    if failed == 0 {
        RunStatus::Completed
    } else if archived + skipped > 0 {
        RunStatus::CompletedWithErrors
    } else {
        RunStatus::Failed
    }
}

enum FileOutcome {
    Archived(ProcessingResult),
    Skipped,
    Failed(String),
}

#[derive(Default)]
struct RunCounters {
    handled: u64,
    archived: u64,
    skipped: u64,
    failed: u64,
    handled_bytes: u64,
    original_bytes: u64,
    output_bytes: u64,
    errors: Vec<String>,
}

/// Everything a worker needs, shared across the pool
struct RunContext {
    job_id: String,
    destination: PathBuf,
    verify_checksums: bool,
    delete_originals: bool,
    registry: Arc<FileRegistry>,
    state: Arc<StateStore>,
    tiering: Arc<TieringEngine>,
    photo: Arc<dyn MediaTransformer>,
    video: Arc<dyn MediaTransformer>,
    progress: Option<ProgressCallback>,
    cancel: Option<CancelCheck>,
    canceled: AtomicBool,
    counters: Mutex<RunCounters>,
    started: Instant,
    total_files: u64,
    total_bytes: u64,
}

impl RunContext {
    fn is_canceled(&self) -> bool {
        if self.canceled.load(Ordering::Relaxed) {
            return true;
        }
        let stop = self.cancel.as_ref().is_some_and(|check| check());
        if stop && !self.canceled.swap(true, Ordering::Relaxed) {
            info!(job_id = %self.job_id, "Cancellation requested, no new files will be started");
        }
        stop
    }

    fn note_state<T>(&self, result: Result<T, StateStoreError>) {
        if let Err(e) = result {
            warn!(job_id = %self.job_id, error = %e, "Failed to update job state");
        }
    }

    /// Registry check, tier resolution, transform and bookkeeping for one file.
    ///
    /// Runs on the blocking pool.
    fn process_file(&self, file: &DiscoveredFile) -> FileOutcome {
        let hash = match hash_file(&file.path) {
            Ok(hash) => hash,
            Err(e) => return FileOutcome::Failed(format!("hashing: {}", e)),
        };

        if let (true, Some(existing)) = self.registry.lookup_hash(&hash) {
            debug!(
                file = %file.path.display(),
                archived_as = %existing.original_path.display(),
                "Content already archived, skipping"
            );
            return FileOutcome::Skipped;
        }

        let resolved = self.tiering.resolve_tier(&file.path, file.modified_time);
        let transformer = match file.kind {
            MediaKind::Photo => &self.photo,
            MediaKind::Video => &self.video,
        };
        let dest = self.destination.join(&file.relative_path);
        debug!(
            file = %file.relative_path.display(),
            kind = %transformer.kind(),
            tier = %resolved.tier.name,
            source = ?resolved.source,
            "Transforming"
        );
        let result = transformer.process(&file.path, &dest, &resolved.tier);

        if let Some(message) = result.error.clone() {
            self.mark_error(&hash, file, &message);
            return FileOutcome::Failed(message);
        }

        let processed_hash = if self.verify_checksums {
            match self.verify(&hash, &result) {
                Ok(processed_hash) => Some(processed_hash),
                Err(message) => {
                    let _ = fs::remove_file(&result.processed_path);
                    self.mark_error(&hash, file, &message);
                    return FileOutcome::Failed(message);
                }
            }
        } else {
            None
        };

        let record = ProcessedFileRecord {
            original_path: file.path.clone(),
            processed_path: Some(result.processed_path.clone()),
            original_size: result.original_size,
            processed_size: result.processed_size,
            original_hash: hash,
            processed_hash,
            processed_at: Utc::now(),
            quality_tier: resolved.tier.name.clone(),
            compression_ratio: result.compression_ratio,
            processing_time_ms: result.duration.as_millis() as u64,
            status: RecordStatus::Completed,
            error_message: None,
        };

        match self.registry.record(record) {
            Ok(()) => {
                if self.delete_originals {
                    match fs::remove_file(&file.path) {
                        Ok(()) => debug!(file = %file.path.display(), "Removed original after archiving"),
                        Err(e) => warn!(file = %file.path.display(), error = %e, "Failed to remove original"),
                    }
                }
            }
            Err(e) => warn!(file = %file.path.display(), error = %e, "Failed to record processed file"),
        }

        // Later files react to space consumed by this one
        self.tiering.update_space_usage();

        FileOutcome::Archived(result)
    }

    /// Hash of the processed output; verbatim copies must match the source
    fn verify(&self, original_hash: &str, result: &ProcessingResult) -> Result<String, String> {
        let processed_hash =
            hash_file(&result.processed_path).map_err(|e| format!("verifying output: {}", e))?;
        if result.action == TransformAction::Copied && processed_hash != original_hash {
            return Err("checksum mismatch after copy".to_string());
        }
        Ok(processed_hash)
    }

    fn mark_error(&self, hash: &str, file: &DiscoveredFile, message: &str) {
        if let Err(e) = self
            .registry
            .mark_error_hash(hash, &file.path, file.size_bytes, message)
        {
            warn!(file = %file.path.display(), error = %e, "Failed to record processing error");
        }
    }

    /// Folds one file's outcome into the run totals and reports progress.
    ///
    /// Progress is published while the counter lock is held so persisted
    /// counts and callbacks never go backwards.
    fn record_outcome(&self, file: &DiscoveredFile, outcome: FileOutcome) {
        let file_label = file.relative_path.display().to_string();

        match &outcome {
            FileOutcome::Archived(result) => {
                info!(
                    job_id = %self.job_id,
                    file = %file_label,
                    tier = %result.tier_name,
                    compression = %format!("{:.1}%", result.compression_ratio * 100.0),
                    "File archived"
                );
                self.note_state(self.state.update_compression_stats(
                    &self.job_id,
                    result.original_size,
                    result.processed_size,
                ));
            }
            FileOutcome::Skipped => {}
            FileOutcome::Failed(message) => {
                warn!(job_id = %self.job_id, file = %file_label, error = %message, "File failed");
                self.note_state(
                    self.state
                        .increment_error_count(&self.job_id, &format!("{}: {}", file_label, message)),
                );
            }
        }

        let mut counters = self.counters.lock();
        counters.handled += 1;
        counters.handled_bytes += file.size_bytes;
        match outcome {
            FileOutcome::Archived(result) => {
                counters.archived += 1;
                counters.original_bytes += result.original_size;
                counters.output_bytes += result.processed_size;
            }
            FileOutcome::Skipped => counters.skipped += 1,
            FileOutcome::Failed(message) => {
                counters.failed += 1;
                counters.errors.push(format!("{}: {}", file_label, message));
            }
        }

        let update = self.snapshot(&counters, Some(file.path.clone()));
        self.note_state(self.state.update_progress(
            &self.job_id,
            update.processed_files,
            update.total_files,
            Some(&file_label),
        ));
        if let Some(progress) = &self.progress {
            progress(&update);
        }
    }

    fn snapshot(&self, counters: &RunCounters, current_file: Option<PathBuf>) -> ProgressUpdate {
        let elapsed = self.started.elapsed();
        let minutes = elapsed.as_secs_f64() / 60.0;
        let rate = if minutes > 0.0 {
            counters.handled as f64 / minutes
        } else {
            0.0
        };
        let remaining = self.total_files.saturating_sub(counters.handled);
        let estimated_remaining = if rate > 0.0 {
            Duration::try_from_secs_f64(remaining as f64 / rate * 60.0).ok()
        } else {
            None
        };

        ProgressUpdate {
            job_id: self.job_id.clone(),
            phase: Phase::Processing,
            current_file,
            processed_files: counters.handled,
            total_files: self.total_files,
            processed_bytes: counters.handled_bytes,
            total_bytes: self.total_bytes,
            elapsed,
            rate,
            estimated_remaining,
            errors: counters.errors.clone(),
        }
    }
}

async fn run_worker(
    ctx: Arc<RunContext>,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<DiscoveredFile>>>,
) -> Result<(), PipelineError> {
    loop {
        // The cancel check may read the job store
        let check_ctx = ctx.clone();
        if tokio::task::spawn_blocking(move || check_ctx.is_canceled()).await? {
            break;
        }

        let next = queue.lock().await.recv().await;
        let Some(file) = next else {
            break;
        };

        let task_ctx = ctx.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = task_ctx.process_file(&file);
            task_ctx.record_outcome(&file, outcome);
        })
        .await?;
    }
    Ok(())
}

/// Drives discovery, tiering and transformation for backup runs.
pub struct Pipeline {
    config: Arc<Config>,
    registry: Arc<FileRegistry>,
    state: Arc<StateStore>,
    tiering: Arc<TieringEngine>,
    photo: Arc<dyn MediaTransformer>,
    video: Arc<dyn MediaTransformer>,
}

impl Pipeline {
    /// Builds the tiering engine from `config` and transformers from tools found on `PATH`
    pub fn new(
        config: Arc<Config>,
        registry: Arc<FileRegistry>,
        state: Arc<StateStore>,
    ) -> Result<Self, PipelineError> {
        let tools = ToolPaths::discover();

        if tools.ffmpeg.is_none() {
            warn!("ffmpeg not found, videos will be archived without transcoding");
        }
        if tools.convert.is_none() {
            warn!("ImageMagick not found, photos will be archived without conversion");
        }
        if tools.exiftool.is_none() {
            warn!("exiftool not found, metadata will not be re-attached");
        }

        Self::with_tools(config, registry, state, tools)
    }

    /// Like [`new`](Self::new) with explicit tool locations
    pub fn with_tools(
        config: Arc<Config>,
        registry: Arc<FileRegistry>,
        state: Arc<StateStore>,
        tools: ToolPaths,
    ) -> Result<Self, PipelineError> {
        let tiering = Arc::new(TieringEngine::new(&config)?);
        Ok(Self::with_components(
            config,
            registry,
            state,
            tiering,
            Arc::new(PhotoTransformer::new(tools.clone())),
            Arc::new(VideoTransformer::new(tools)),
        ))
    }

    pub fn with_components(
        config: Arc<Config>,
        registry: Arc<FileRegistry>,
        state: Arc<StateStore>,
        tiering: Arc<TieringEngine>,
        photo: Arc<dyn MediaTransformer>,
        video: Arc<dyn MediaTransformer>,
    ) -> Self {
        Self {
            config,
            registry,
            state,
            tiering,
            photo,
            video,
        }
    }

    pub fn tiering(&self) -> &Arc<TieringEngine> {
        &self.tiering
    }

    pub fn registry(&self) -> &Arc<FileRegistry> {
        &self.registry
    }

    /// Media files under `source` admitted by the patterns
    pub fn discover(
        &self,
        source: &Path,
        include: &[String],
        exclude: &[String],
    ) -> Result<Vec<DiscoveredFile>, PipelineError> {
        let filter = PatternFilter::new(include, exclude)?;
        Ok(discover_files(source, &filter)?)
    }

    /// Rough wall-clock estimate for archiving everything under `source`
    pub fn estimate_processing_time(&self, source: &Path, max_concurrency: u32) -> Result<Duration, PipelineError> {
        let files = self.discover(source, &[], &[])?;
        let serial: Duration = files
            .iter()
            .map(|f| match f.kind {
                MediaKind::Photo => PHOTO_ESTIMATE,
                MediaKind::Video => VIDEO_ESTIMATE_PER_MB.mul_f64(f.size_bytes as f64 / (1024.0 * 1024.0)),
            })
            .sum();
        let workers = WorkerPlan::derive(max_concurrency, &self.config.processing).workers;
        Ok(serial / workers)
    }

    /// Runs discovery then processing to completion (or cancellation).
    ///
    /// Only a failed discovery or a crashed worker is an `Err`; per-file
    /// problems are reported in the outcome.
    pub async fn run(&self, request: PipelineRequest) -> Result<PipelineOutcome, PipelineError> {
        let started = Instant::now();
        let job_id = request.job_id.clone();
        info!(job_id = %job_id, source = %request.source.display(), "Starting discovery");

        let filter = PatternFilter::new(&request.include, &request.exclude)?;
        let source = request.source.clone();
        let state = self.state.clone();
        let discovery_id = job_id.clone();
        let files = tokio::task::spawn_blocking(move || {
            if let Err(e) = state.add_phase_stats(&discovery_id, Phase::Discovery.as_str(), 0) {
                warn!(job_id = %discovery_id, error = %e, "Failed to update job state");
            }
            discover_files(&source, &filter)
        })
        .await??;

        let total_files = files.len() as u64;
        let total_bytes: u64 = files.iter().map(|f| f.size_bytes).sum();
        info!(job_id = %job_id, files = total_files, bytes = total_bytes, "Discovery complete");

        let state = self.state.clone();
        let tiering = self.tiering.clone();
        let progress = request.progress.clone();
        let phase_id = job_id.clone();
        tokio::task::spawn_blocking(move || {
            let note = |result: Result<(), StateStoreError>| {
                if let Err(e) = result {
                    warn!(job_id = %phase_id, error = %e, "Failed to update job state");
                }
            };
            note(state.set_totals(&phase_id, total_files, total_bytes).map(|_| ()));
            note(
                state
                    .add_phase_stats(&phase_id, Phase::Processing.as_str(), total_files)
                    .map(|_| ()),
            );
            if let Some(progress) = &progress {
                progress(&ProgressUpdate {
                    job_id: phase_id.clone(),
                    phase: Phase::Discovery,
                    current_file: None,
                    processed_files: 0,
                    total_files,
                    processed_bytes: 0,
                    total_bytes,
                    elapsed: started.elapsed(),
                    rate: 0.0,
                    estimated_remaining: None,
                    errors: Vec::new(),
                });
            }
            tiering.update_space_usage();
        })
        .await?;

        let plan = WorkerPlan::derive(request.max_concurrency, &self.config.processing);
        let workers = plan.for_backlog(files.len());

        let (tx, rx) = mpsc::channel(files.len().max(1));
        for file in files {
            // Capacity covers the whole backlog
            if tx.try_send(file).is_err() {
                warn!(job_id = %job_id, "Work queue rejected a file");
            }
        }
        drop(tx);

        let ctx = Arc::new(RunContext {
            job_id: job_id.clone(),
            destination: request.destination.clone(),
            verify_checksums: request.verify_checksums,
            delete_originals: request.delete_originals,
            registry: self.registry.clone(),
            state: self.state.clone(),
            tiering: self.tiering.clone(),
            photo: self.photo.clone(),
            video: self.video.clone(),
            progress: request.progress.clone(),
            cancel: request.cancel.clone(),
            canceled: AtomicBool::new(false),
            counters: Mutex::new(RunCounters::default()),
            started,
            total_files,
            total_bytes,
        });

        info!(job_id = %job_id, workers, "Processing files");
        let queue = Arc::new(tokio::sync::Mutex::new(rx));
        let mut pool = JoinSet::new();
        for _ in 0..workers {
            pool.spawn(run_worker(ctx.clone(), queue.clone()));
        }
        while let Some(joined) = pool.join_next().await {
            joined??;
        }

        let counters = std::mem::take(&mut *ctx.counters.lock());
        let outcome = PipelineOutcome {
            job_id: job_id.clone(),
            status: run_status(counters.archived, counters.skipped, counters.failed),
            total_files,
            processed_files: counters.archived,
            skipped_files: counters.skipped,
            failed_files: counters.failed,
            canceled: ctx.canceled.load(Ordering::Relaxed),
            total_original_bytes: counters.original_bytes,
            total_processed_bytes: counters.output_bytes,
            compression_ratio: crate::media::compression_ratio(counters.original_bytes, counters.output_bytes),
            elapsed: started.elapsed(),
            errors: counters.errors,
        };

        info!(
            job_id = %job_id,
            status = %outcome.status,
            processed = outcome.processed_files,
            skipped = outcome.skipped_files,
            failed = outcome.failed_files,
            canceled = outcome.canceled,
            "Run finished"
        );
        Ok(outcome)
    }
}
