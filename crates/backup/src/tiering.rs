//! Tier resolution for a single file.
//!
//! Precedence, highest first: folder override, date-range exception, age
//! curve. Space pressure is applied afterwards to whichever tier won.

use crate::space::SpaceMonitor;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tiered_backup_config::{
    Config, DateRangeException, MetadataLevel, QualityTier, TierCatalog, ValidationErrors,
    MAX_VIDEO_CRF,
};
use tracing::{debug, info};

/// Estimated output/input size ratio across all tiers
const ESTIMATED_OUTPUT_RATIO: f64 = 0.4;

/// Rough usage reduction expected from adjusting one tier, in percent
const REDUCTION_PER_TIER_PERCENT: f64 = 5.0;

/// Why a tier was chosen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TierSource {
    FolderOverride { folder: PathBuf },
    DateRange { description: String },
    Age { days: u64 },
}

/// A proposed delta to one tier's compression parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierAdjustment {
    pub tier_name: String,
    pub original_crf: u32,
    pub adjusted_crf: u32,
    pub original_quality: u32,
    pub adjusted_quality: u32,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// The tier to use for one file, already adjusted for space pressure
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTier {
    pub tier: QualityTier,
    pub source: TierSource,
    pub adjustment: Option<TierAdjustment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierSummary {
    pub name: String,
    pub age_threshold_days: u32,
    pub video_crf: u32,
    pub photo_quality: u32,
    pub metadata_level: MetadataLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierStatistics {
    pub total_tiers: usize,
    pub current_usage_bytes: u64,
    pub max_usage_bytes: u64,
    pub usage_percent: f64,
    pub space_pressure_active: bool,
    pub tiers: Vec<TierSummary>,
}

/// Raises compression on a copy of `tier`.
///
/// CRF grows by `step` up to 51. Photo quality drops by `step` but never
/// below `quality_floor`, and a quality already under the floor is left alone.
pub fn adjust_tier(tier: &QualityTier, step: u32, quality_floor: u32, reason: &str) -> (QualityTier, TierAdjustment) {
    let mut adjusted = tier.clone();
    adjusted.video_crf = tier.video_crf.saturating_add(step).min(MAX_VIDEO_CRF).max(tier.video_crf);
    if tier.photo_quality > quality_floor {
        adjusted.photo_quality = tier.photo_quality.saturating_sub(step).max(quality_floor);
    }

    let adjustment = TierAdjustment {
        tier_name: tier.name.clone(),
        original_crf: tier.video_crf,
        adjusted_crf: adjusted.video_crf,
        original_quality: tier.photo_quality,
        adjusted_quality: adjusted.photo_quality,
        reason: reason.to_string(),
        timestamp: Utc::now(),
    };
    (adjusted, adjustment)
}

/// Resolves the effective tier for files
#[derive(Debug)]
pub struct TieringEngine {
    catalog: TierCatalog,
    folder_overrides: Vec<(PathBuf, String)>,
    date_ranges: Vec<DateRangeException>,
    step: u32,
    quality_floor: u32,
    monitor: SpaceMonitor,
    usage_bytes: AtomicU64,
    pressure: AtomicBool,
    pressure_override: RwLock<Option<bool>>,
}

impl TieringEngine {
    /// Builds an engine whose space monitor watches `config.data_dir`
    pub fn new(config: &Config) -> Result<Self, ValidationErrors> {
        let monitor = SpaceMonitor::new(
            config.data_dir.clone(),
            config.storage_limit_bytes(),
            config.processing.space_pressure_threshold,
        )
        .with_cache_ttl(Duration::from_secs(config.processing.usage_cache_secs));
        Self::with_monitor(config, monitor)
    }

    pub fn with_monitor(config: &Config, monitor: SpaceMonitor) -> Result<Self, ValidationErrors> {
        let catalog = config.catalog()?;
        let folder_overrides = config
            .preferences
            .folder_overrides
            .iter()
            .map(|(folder, tier)| (PathBuf::from(folder), tier.clone()))
            .collect();

        Ok(Self {
            catalog,
            folder_overrides,
            date_ranges: config.preferences.date_range_exceptions.clone(),
            step: config.processing.quality_adjustment_step,
            quality_floor: config.processing.min_photo_quality,
            monitor,
            usage_bytes: AtomicU64::new(0),
            pressure: AtomicBool::new(false),
            pressure_override: RwLock::new(None),
        })
    }

    pub fn catalog(&self) -> &TierCatalog {
        &self.catalog
    }

    pub fn monitor(&self) -> &SpaceMonitor {
        &self.monitor
    }

    pub fn resolve_tier(&self, path: &Path, modified: SystemTime) -> ResolvedTier {
        self.resolve_tier_at(path, modified, SystemTime::now())
    }

    /// Like [`resolve_tier`](Self::resolve_tier) with an explicit clock
    pub fn resolve_tier_at(&self, path: &Path, modified: SystemTime, now: SystemTime) -> ResolvedTier {
        let (base, source) = self.base_tier(path, modified, now);

        if !self.pressure_active() {
            return ResolvedTier {
                tier: base.clone(),
                source,
                adjustment: None,
            };
        }

        let (tier, adjustment) = adjust_tier(base, self.step, self.quality_floor, "space pressure");
        debug!(
            tier = %tier.name,
            crf = tier.video_crf,
            quality = tier.photo_quality,
            "Applied space pressure adjustment"
        );
        ResolvedTier {
            tier,
            source,
            adjustment: Some(adjustment),
        }
    }

    fn base_tier(&self, path: &Path, modified: SystemTime, now: SystemTime) -> (&QualityTier, TierSource) {
        if let Some((folder, tier)) = self.folder_override(path) {
            return (
                tier,
                TierSource::FolderOverride {
                    folder: folder.to_path_buf(),
                },
            );
        }

        let stamp: DateTime<Utc> = modified.into();
        for exception in &self.date_ranges {
            if exception.contains(stamp) {
                if let Some(tier) = self.catalog.by_name(&exception.force_tier) {
                    return (
                        tier,
                        TierSource::DateRange {
                            description: exception.description.clone(),
                        },
                    );
                }
            }
        }

        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        let days = age.as_secs() / (24 * 60 * 60);
        (self.catalog.tier_for_age_days(days), TierSource::Age { days })
    }

    /// Most specific configured folder containing `path`
    fn folder_override(&self, path: &Path) -> Option<(&Path, &QualityTier)> {
        self.folder_overrides
            .iter()
            .filter(|(folder, _)| path.starts_with(folder))
            .max_by_key(|(folder, _)| folder.components().count())
            .and_then(|(folder, name)| self.catalog.by_name(name).map(|t| (folder.as_path(), t)))
    }

    /// Rescans usage (subject to the monitor cache) and updates the pressure flag
    pub fn update_space_usage(&self) -> bool {
        let usage = self.monitor.current_usage();
        let limit = self.monitor.limit_bytes();
        let active = limit > 0 && usage as f64 > limit as f64 * self.monitor.threshold();

        self.usage_bytes.store(usage, Ordering::Relaxed);
        let was = self.pressure.swap(active, Ordering::Relaxed);
        if was != active {
            info!(usage, limit, active, "Space pressure changed");
        }
        active
    }

    /// Pins the pressure flag; `None` returns control to the monitor
    pub fn set_pressure_override(&self, value: Option<bool>) {
        *self.pressure_override.write() = value;
    }

    pub fn pressure_active(&self) -> bool {
        match *self.pressure_override.read() {
            Some(pinned) => pinned,
            None => self.pressure.load(Ordering::Relaxed),
        }
    }

    fn usage_percent(&self) -> f64 {
        let limit = self.monitor.limit_bytes();
        if limit == 0 {
            return 0.0;
        }
        self.usage_bytes.load(Ordering::Relaxed) as f64 / limit as f64 * 100.0
    }

    /// Adjustments that would bring usage down to `target_usage_percent`, oldest tier first
    pub fn recommend_adjustments(&self, target_usage_percent: f64) -> Vec<TierAdjustment> {
        self.update_space_usage();
        let current = self.usage_percent();
        if current <= target_usage_percent {
            return Vec::new();
        }

        let mut remaining = current - target_usage_percent;
        let mut recommendations = Vec::new();
        for tier in self.catalog.tiers().iter().rev() {
            if remaining <= 0.0 {
                break;
            }
            let reason = format!("Reduce usage by ~{:.1}%", remaining);
            let (_, adjustment) = adjust_tier(tier, self.step, self.quality_floor, &reason);
            recommendations.push(adjustment);
            remaining -= REDUCTION_PER_TIER_PERCENT;
        }
        recommendations
    }

    /// Archive bytes expected for `file_count` files of `avg_file_bytes` each
    pub fn estimate_space_required(&self, file_count: u64, avg_file_bytes: u64) -> u64 {
        let raw = file_count.saturating_mul(avg_file_bytes);
        (raw as f64 * ESTIMATED_OUTPUT_RATIO) as u64
    }

    pub fn statistics(&self) -> TierStatistics {
        TierStatistics {
            total_tiers: self.catalog.len(),
            current_usage_bytes: self.usage_bytes.load(Ordering::Relaxed),
            max_usage_bytes: self.monitor.limit_bytes(),
            usage_percent: self.usage_percent(),
            space_pressure_active: self.pressure_active(),
            tiers: self
                .catalog
                .tiers()
                .iter()
                .map(|t| TierSummary {
                    name: t.name.clone(),
                    age_threshold_days: t.age_threshold_days,
                    video_crf: t.video_crf,
                    photo_quality: t.photo_quality,
                    metadata_level: t.metadata_level.clone(),
                })
                .collect(),
        }
    }
}
