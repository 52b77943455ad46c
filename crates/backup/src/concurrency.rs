//! Worker pool sizing for a pipeline run.
//!
//! Derives the number of workers from the job's requested concurrency and the
//! administrator's configured ceiling.

use tiered_backup_config::{ProcessingSettings, CONCURRENCY_HARD_LIMIT};

/// Worker count for one run, with the inputs it was derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPlan {
    /// Concurrency the job asked for (0 = use the configured default)
    pub requested: u32,
    /// Effective upper bound after applying the hard limit
    pub ceiling: u32,
    /// Workers that will actually be spawned
    pub workers: u32,
}

impl WorkerPlan {
    /// Derive a worker plan for a job
    ///
    /// Uses the following rules:
    /// - A request of 0 falls back to `settings.max_concurrency`
    /// - The ceiling is `settings.max_concurrency_ceiling`, never above the hard limit
    /// - Workers are clamped to `[1, ceiling]`
    pub fn derive(requested: u32, settings: &ProcessingSettings) -> Self {
        let ceiling = settings.max_concurrency_ceiling.clamp(1, CONCURRENCY_HARD_LIMIT);
        let wanted = if requested > 0 {
            requested
        } else {
            settings.max_concurrency
        };

        Self {
            requested,
            ceiling,
            workers: wanted.clamp(1, ceiling),
        }
    }

    /// Never more workers than there is work, but at least one
    pub fn for_backlog(self, files: usize) -> usize {
        (self.workers as usize).min(files.max(1))
    }
}
