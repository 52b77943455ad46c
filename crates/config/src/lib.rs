//! Configuration for the tiered backup pipeline
//!
//! Handles loading the TOML document, environment variable overrides,
//! the quality tier catalog and aggregated validation.

pub mod config;
pub mod tiers;
pub mod validation;

pub use config::*;
pub use tiers::{validate_tiers, MetadataLevel, QualityTier, TierCatalog, MAX_PHOTO_QUALITY, MAX_VIDEO_CRF};
pub use validation::{ValidationError, ValidationErrors};
