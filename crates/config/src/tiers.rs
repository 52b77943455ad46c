//! Quality tier catalog
//!
//! An ordered list of tiers, each describing the output fidelity for files
//! up to a given age. Thresholds strictly increase; the last tier catches
//! everything older than the previous thresholds.

use crate::validation::{ValidationError, ValidationErrors};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Highest legal video compression level (x264 CRF scale)
pub const MAX_VIDEO_CRF: u32 = 51;
/// Highest legal photo quality
pub const MAX_PHOTO_QUALITY: u32 = 100;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// How much of the original metadata survives processing.
///
/// Unknown strings are kept as `Unrecognized` so that validation can report
/// them alongside every other field error instead of aborting the parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MetadataLevel {
    /// Every tag is copied back
    Full,
    /// Timestamp, camera, GPS and dimensions
    Essential,
    /// Timestamp and camera only
    Minimal,
    /// Anything else found in the document
    Unrecognized(String),
}

impl MetadataLevel {
    pub fn as_str(&self) -> &str {
        match self {
            MetadataLevel::Full => "full",
            MetadataLevel::Essential => "essential",
            MetadataLevel::Minimal => "minimal",
            MetadataLevel::Unrecognized(s) => s,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, MetadataLevel::Unrecognized(_))
    }
}

impl From<String> for MetadataLevel {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "full" => MetadataLevel::Full,
            "essential" => MetadataLevel::Essential,
            "minimal" => MetadataLevel::Minimal,
            _ => MetadataLevel::Unrecognized(s),
        }
    }
}

impl From<MetadataLevel> for String {
    fn from(level: MetadataLevel) -> Self {
        level.as_str().to_string()
    }
}

impl std::fmt::Display for MetadataLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target output fidelity for one age bracket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QualityTier {
    pub name: String,
    /// Files whose age in days is <= this value qualify
    pub age_threshold_days: u32,
    /// Maximum photo area in pixels (width * height)
    pub photo_max_resolution: u64,
    /// Photo encoder quality, 1-100
    pub photo_quality: u32,
    pub video_max_height: u32,
    pub video_max_fps: u32,
    /// Video compression level, 0-51, higher means smaller output
    pub video_crf: u32,
    pub metadata_level: MetadataLevel,
}

impl QualityTier {
    /// Maximum photo resolution in whole megapixels
    pub fn photo_megapixels(&self) -> u64 {
        self.photo_max_resolution / 1_000_000
    }
}

/// Returns true if the tier name only uses letters, digits, whitespace and `()-+`
fn is_valid_tier_name(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_alphanumeric() || c.is_whitespace() || matches!(c, '(' | ')' | '-' | '+'))
}

/// Validates a tier list, returning every problem found.
pub fn validate_tiers(tiers: &[QualityTier]) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if tiers.is_empty() {
        errors.push(ValidationError::new(
            "quality_tiers",
            "at least one quality tier must be defined",
        ));
        return errors;
    }

    let mut seen = HashSet::new();
    let mut previous_threshold: Option<u32> = None;

    for (i, tier) in tiers.iter().enumerate() {
        let prefix = format!("quality_tiers[{}]", i);

        let name = tier.name.trim();
        if name.is_empty() {
            errors.push(ValidationError::new(format!("{}.name", prefix), "cannot be empty"));
        } else if !is_valid_tier_name(name) {
            errors.push(ValidationError::new(
                format!("{}.name", prefix),
                "contains invalid characters",
            ));
        } else if !seen.insert(name.to_string()) {
            errors.push(ValidationError::new(
                format!("{}.name", prefix),
                "duplicate tier name",
            ));
        }

        if let Some(prev) = previous_threshold {
            if tier.age_threshold_days <= prev {
                errors.push(ValidationError::new(
                    format!("{}.age_threshold_days", prefix),
                    "must be greater than previous tier threshold",
                ));
            }
        }
        previous_threshold = Some(tier.age_threshold_days);

        if tier.photo_max_resolution == 0 {
            errors.push(ValidationError::new(
                format!("{}.photo_max_resolution", prefix),
                "must be greater than 0",
            ));
        }

        if tier.photo_quality < 1 || tier.photo_quality > MAX_PHOTO_QUALITY {
            errors.push(ValidationError::new(
                format!("{}.photo_quality", prefix),
                "must be between 1 and 100",
            ));
        }

        if tier.video_max_height == 0 {
            errors.push(ValidationError::new(
                format!("{}.video_max_height", prefix),
                "must be greater than 0",
            ));
        }

        if tier.video_max_fps == 0 {
            errors.push(ValidationError::new(
                format!("{}.video_max_fps", prefix),
                "must be greater than 0",
            ));
        }

        if tier.video_crf > MAX_VIDEO_CRF {
            errors.push(ValidationError::new(
                format!("{}.video_crf", prefix),
                "must be between 0 and 51",
            ));
        }

        if !tier.metadata_level.is_recognized() {
            errors.push(ValidationError::new(
                format!("{}.metadata_level", prefix),
                "must be 'full', 'essential', or 'minimal'",
            ));
        }
    }

    errors
}

/// A validated, non-empty, threshold-ordered list of tiers
#[derive(Debug, Clone, PartialEq)]
pub struct TierCatalog {
    tiers: Vec<QualityTier>,
}

impl TierCatalog {
    /// Builds a catalog, rejecting anything `validate_tiers` complains about.
    pub fn new(tiers: Vec<QualityTier>) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        errors.extend(validate_tiers(&tiers));
        errors.into_result()?;
        Ok(Self { tiers })
    }

    /// Returns the first tier whose threshold covers `age`, or the last tier.
    pub fn tier_for_age(&self, age: Duration) -> &QualityTier {
        self.tier_for_age_days(age.as_secs() / SECS_PER_DAY)
    }

    /// Same as [`tier_for_age`](Self::tier_for_age) with the age already in whole days.
    pub fn tier_for_age_days(&self, days: u64) -> &QualityTier {
        self.tiers
            .iter()
            .find(|tier| days <= u64::from(tier.age_threshold_days))
            .unwrap_or_else(|| self.last())
    }

    pub fn by_name(&self, name: &str) -> Option<&QualityTier> {
        self.tiers.iter().find(|tier| tier.name == name)
    }

    /// The oldest, most compressed tier
    pub fn last(&self) -> &QualityTier {
        // Non-empty by construction
        &self.tiers[self.tiers.len() - 1]
    }

    pub fn tiers(&self) -> &[QualityTier] {
        &self.tiers
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tier(name: &str, threshold: u32, crf: u32) -> QualityTier {
        QualityTier {
            name: name.to_string(),
            age_threshold_days: threshold,
            photo_max_resolution: 12_000_000,
            photo_quality: 90,
            video_max_height: 1080,
            video_max_fps: 60,
            video_crf: crf,
            metadata_level: MetadataLevel::Full,
        }
    }

    fn three_tier_catalog() -> TierCatalog {
        TierCatalog::new(vec![
            tier("Recent", 365, 20),
            tier("Older", 1095, 23),
            tier("Archive", 999_999, 26),
        ])
        .expect("valid catalog")
    }

    #[test]
    fn test_tier_for_age_brackets() {
        let catalog = three_tier_catalog();
        assert_eq!(catalog.tier_for_age_days(10).name, "Recent");
        assert_eq!(catalog.tier_for_age_days(365).name, "Recent");
        assert_eq!(catalog.tier_for_age_days(400).name, "Older");
        assert_eq!(catalog.tier_for_age_days(5000).name, "Archive");
        assert_eq!(
            catalog.tier_for_age(Duration::from_secs(400 * SECS_PER_DAY)).name,
            "Older"
        );
    }

    #[test]
    fn test_age_beyond_every_threshold_uses_last_tier() {
        let catalog =
            TierCatalog::new(vec![tier("A", 30, 20), tier("B", 60, 30)]).expect("valid catalog");
        assert_eq!(catalog.tier_for_age_days(10_000).name, "B");
    }

    #[test]
    fn test_partial_day_rounds_down() {
        let catalog = three_tier_catalog();
        let just_under = Duration::from_secs(366 * SECS_PER_DAY - 1);
        assert_eq!(catalog.tier_for_age(just_under).name, "Recent");
    }

    #[test]
    fn test_empty_catalog_rejected() {
        let errors = TierCatalog::new(Vec::new()).unwrap_err();
        assert!(errors.has_field("quality_tiers"));
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let mut bad = tier("Recent", 365, 60);
        bad.photo_quality = 0;
        bad.metadata_level = MetadataLevel::Unrecognized("everything".to_string());
        let duplicate = tier("Recent", 100, 20);

        let errors = TierCatalog::new(vec![bad, duplicate]).unwrap_err();

        assert!(errors.has_field("quality_tiers[0].video_crf"));
        assert!(errors.has_field("quality_tiers[0].photo_quality"));
        assert!(errors.has_field("quality_tiers[0].metadata_level"));
        assert!(errors.has_field("quality_tiers[1].name"));
        assert!(errors.has_field("quality_tiers[1].age_threshold_days"));
    }

    #[test]
    fn test_tier_name_characters() {
        assert!(is_valid_tier_name("Space Optimized (3+ years)"));
        assert!(is_valid_tier_name("High Quality (0-12 months)"));
        assert!(!is_valid_tier_name("bad/name"));
    }

    #[test]
    fn test_metadata_level_strings() {
        assert_eq!(MetadataLevel::from("Full".to_string()), MetadataLevel::Full);
        assert_eq!(MetadataLevel::from("minimal".to_string()), MetadataLevel::Minimal);
        assert_eq!(
            MetadataLevel::from("raw".to_string()),
            MetadataLevel::Unrecognized("raw".to_string())
        );
        assert_eq!(String::from(MetadataLevel::Essential), "essential");
    }

    #[test]
    fn test_by_name_and_last() {
        let catalog = three_tier_catalog();
        assert_eq!(catalog.by_name("Older").map(|t| t.video_crf), Some(23));
        assert!(catalog.by_name("Missing").is_none());
        assert_eq!(catalog.last().name, "Archive");
        assert_eq!(catalog.len(), 3);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // For any strictly increasing thresholds, the chosen tier is the first
        // whose threshold covers the age, and never a tier whose threshold is
        // smaller than the age unless it is the last one.
        #[test]
        fn prop_tier_for_age_is_first_covering(
            steps in prop::collection::vec(1u32..2000, 1..6),
            age in 0u64..20_000,
        ) {
            let mut threshold = 0u32;
            let tiers: Vec<QualityTier> = steps
                .iter()
                .enumerate()
                .map(|(i, step)| {
                    threshold += step;
                    tier(&format!("Tier {}", i), threshold, 20)
                })
                .collect();
            let catalog = TierCatalog::new(tiers.clone()).expect("increasing thresholds are valid");

            let chosen = catalog.tier_for_age_days(age);
            let idx = tiers.iter().position(|t| t.name == chosen.name).unwrap();

            if idx + 1 < tiers.len() {
                prop_assert!(age <= u64::from(chosen.age_threshold_days));
            }
            for earlier in &tiers[..idx] {
                prop_assert!(age > u64::from(earlier.age_threshold_days));
            }
        }
    }
}
