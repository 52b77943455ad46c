//! Tiered media backup
//!
//! Walks a media library, picks a quality tier per file from its age, user
//! overrides and archive space pressure, then copies or transcodes it under
//! bounded concurrency. Archived content is tracked by hash so no file is
//! processed twice.

pub mod atomic;
pub mod concurrency;
pub mod discovery;
pub mod jobs;
pub mod media;
pub mod pipeline;
pub mod registry;
pub mod runner;
pub mod space;
pub mod state;
pub mod tiering;

pub use tiered_backup_config as config;
pub use tiered_backup_config::Config;
pub use concurrency::WorkerPlan;
pub use discovery::{discover_files, DiscoveredFile, DiscoveryError, PatternFilter};
pub use jobs::{BackupJob, JobSettings, JobStatistics, JobStatus, JobStore, JobStoreError, NewJob};
pub use media::{
    MediaKind, MediaMetadata, MediaTransformer, PhotoTransformer, ProcessingResult, ToolPaths,
    TransformAction, TransformError, VideoTransformer,
};
pub use pipeline::{
    CancelCheck, Phase, Pipeline, PipelineError, PipelineOutcome, PipelineRequest,
    ProgressCallback, ProgressUpdate, RunStatus,
};
pub use registry::{
    hash_file, FileRegistry, ProcessedFileRecord, RecordStatus, RegistryError, RegistryStats,
};
pub use runner::{
    BackupService, CleanupReport, JobStatusView, RunnerError, ServiceStatistics, StorageStatus,
};
pub use space::{SpaceError, SpaceMonitor, SpaceStatus};
pub use state::{
    BackupStatistics, JobState, PhaseStats, PipelineSummary, ProcessingStatistics, StateStore,
    StateStoreError, SystemState,
};
pub use tiering::{adjust_tier, ResolvedTier, TierAdjustment, TierSource, TieringEngine};
