//! Core configuration structures and loading logic

use crate::tiers::{validate_tiers, MetadataLevel, QualityTier, TierCatalog};
use crate::validation::ValidationErrors;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Current configuration document version
pub const CONFIG_VERSION: u32 = 1;

/// Hard upper bound for per-job worker concurrency
pub const CONCURRENCY_HARD_LIMIT: u32 = 10;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading or writing the config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// TOML serialization error
    Serialize(toml::ser::Error),
    /// Document parsed but failed validation
    Invalid(ValidationErrors),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to access config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Serialize(e) => write!(f, "Failed to serialize config: {}", e),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(e: toml::ser::Error) -> Self {
        ConfigError::Serialize(e)
    }
}

impl From<ValidationErrors> for ConfigError {
    fn from(e: ValidationErrors) -> Self {
        ConfigError::Invalid(e)
    }
}

/// Worker pool and space-pressure settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingSettings {
    /// Default workers per job
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
    /// Administrator cap on per-job workers
    #[serde(default = "default_max_concurrency_ceiling")]
    pub max_concurrency_ceiling: u32,
    /// Scratch directory for intermediate encoder output
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Fraction of the storage limit above which pressure is raised (0-1]
    #[serde(default = "default_space_pressure_threshold")]
    pub space_pressure_threshold: f64,
    /// CRF increase / photo quality decrease applied under pressure
    #[serde(default = "default_quality_adjustment_step")]
    pub quality_adjustment_step: u32,
    /// Pressure never pushes photo quality below this
    #[serde(default = "default_min_photo_quality")]
    pub min_photo_quality: u32,
    /// How long a usage scan stays valid
    #[serde(default = "default_usage_cache_secs")]
    pub usage_cache_secs: u64,
}

fn default_max_concurrency() -> u32 {
    2
}

fn default_max_concurrency_ceiling() -> u32 {
    CONCURRENCY_HARD_LIMIT
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("/tmp/backup_processing")
}

fn default_space_pressure_threshold() -> f64 {
    0.9
}

fn default_quality_adjustment_step() -> u32 {
    2
}

fn default_min_photo_quality() -> u32 {
    50
}

fn default_usage_cache_secs() -> u64 {
    300
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_concurrency_ceiling: default_max_concurrency_ceiling(),
            temp_dir: default_temp_dir(),
            space_pressure_threshold: default_space_pressure_threshold(),
            quality_adjustment_step: default_quality_adjustment_step(),
            min_photo_quality: default_min_photo_quality(),
            usage_cache_secs: default_usage_cache_secs(),
        }
    }
}

/// Forces a tier for files whose timestamp falls within `[start, end)`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DateRangeException {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub force_tier: String,
    #[serde(default)]
    pub description: String,
}

impl DateRangeException {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// Administrator overrides on top of the age curve
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct UserPreferences {
    #[serde(default)]
    pub email_notifications: bool,
    /// Folder path -> tier name
    #[serde(default)]
    pub folder_overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub date_range_exceptions: Vec<DateRangeException>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_storage_limit_gb")]
    pub storage_limit_gb: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_quality_tiers")]
    pub quality_tiers: Vec<QualityTier>,
    #[serde(default)]
    pub processing: ProcessingSettings,
    #[serde(default)]
    pub preferences: UserPreferences,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/tiered-backup")
}

fn default_storage_limit_gb() -> u64 {
    100
}

fn default_retention_days() -> u32 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

/// The three-step age curve shipped with a fresh install
pub fn default_quality_tiers() -> Vec<QualityTier> {
    vec![
        QualityTier {
            name: "High Quality (0-12 months)".to_string(),
            age_threshold_days: 365,
            photo_max_resolution: 12_000_000,
            photo_quality: 92,
            video_max_height: 1080,
            video_max_fps: 60,
            video_crf: 20,
            metadata_level: MetadataLevel::Full,
        },
        QualityTier {
            name: "Medium Quality (1-3 years)".to_string(),
            age_threshold_days: 1095,
            photo_max_resolution: 8_000_000,
            photo_quality: 88,
            video_max_height: 1080,
            video_max_fps: 30,
            video_crf: 23,
            metadata_level: MetadataLevel::Essential,
        },
        QualityTier {
            name: "Space Optimized (3+ years)".to_string(),
            age_threshold_days: 999_999,
            photo_max_resolution: 8_000_000,
            photo_quality: 80,
            video_max_height: 720,
            video_max_fps: 30,
            video_crf: 26,
            metadata_level: MetadataLevel::Minimal,
        },
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            data_dir: default_data_dir(),
            storage_limit_gb: default_storage_limit_gb(),
            retention_days: default_retention_days(),
            log_level: default_log_level(),
            quality_tiers: default_quality_tiers(),
            processing: ProcessingSettings::default(),
            preferences: UserPreferences::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing optional fields fall back to defaults. No validation happens here.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Serialize to a TOML document
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - BACKUP_DATA_DIR -> data_dir
    /// - BACKUP_STORAGE_LIMIT_GB -> storage_limit_gb
    /// - BACKUP_MAX_CONCURRENCY -> processing.max_concurrency
    /// - BACKUP_TEMP_DIR -> processing.temp_dir
    /// - BACKUP_LOG_LEVEL -> log_level
    /// - BACKUP_SPACE_PRESSURE_THRESHOLD -> processing.space_pressure_threshold
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("BACKUP_DATA_DIR") {
            if !val.trim().is_empty() {
                self.data_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("BACKUP_STORAGE_LIMIT_GB") {
            if let Ok(limit) = val.parse::<u64>() {
                self.storage_limit_gb = limit;
            }
        }

        if let Ok(val) = env::var("BACKUP_MAX_CONCURRENCY") {
            if let Ok(workers) = val.parse::<u32>() {
                self.processing.max_concurrency = workers;
            }
        }

        if let Ok(val) = env::var("BACKUP_TEMP_DIR") {
            if !val.trim().is_empty() {
                self.processing.temp_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("BACKUP_LOG_LEVEL") {
            let level = val.trim().to_lowercase();
            if LOG_LEVELS.contains(&level.as_str()) {
                self.log_level = level;
            }
        }

        if let Ok(val) = env::var("BACKUP_SPACE_PRESSURE_THRESHOLD") {
            if let Ok(threshold) = val.parse::<f64>() {
                self.processing.space_pressure_threshold = threshold;
            }
        }
    }

    /// Check every field, returning all problems found
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.version != CONFIG_VERSION {
            errors.push(
                "version",
                format!("unsupported version {}, expected {}", self.version, CONFIG_VERSION),
            );
        }
        if self.data_dir.as_os_str().is_empty() {
            errors.push("data_dir", "cannot be empty");
        }
        if self.storage_limit_gb == 0 {
            errors.push("storage_limit_gb", "must be greater than 0");
        }
        if self.retention_days < 1 {
            errors.push("retention_days", "must be at least 1 day");
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            errors.push("log_level", "must be one of trace, debug, info, warn, error");
        }

        errors.extend(validate_tiers(&self.quality_tiers));
        self.validate_processing(&mut errors);
        self.validate_preferences(&mut errors);

        errors.into_result()
    }

    fn validate_processing(&self, errors: &mut ValidationErrors) {
        let p = &self.processing;

        if p.max_concurrency_ceiling < 1 || p.max_concurrency_ceiling > CONCURRENCY_HARD_LIMIT {
            errors.push(
                "processing.max_concurrency_ceiling",
                format!("must be between 1 and {}", CONCURRENCY_HARD_LIMIT),
            );
        }
        if p.max_concurrency < 1 || p.max_concurrency > p.max_concurrency_ceiling {
            errors.push(
                "processing.max_concurrency",
                format!("must be between 1 and {}", p.max_concurrency_ceiling),
            );
        }
        if p.temp_dir.as_os_str().is_empty() {
            errors.push("processing.temp_dir", "cannot be empty");
        }
        if !(p.space_pressure_threshold > 0.0 && p.space_pressure_threshold <= 1.0) {
            errors.push(
                "processing.space_pressure_threshold",
                "must be greater than 0 and at most 1",
            );
        }
        if p.quality_adjustment_step < 1 || p.quality_adjustment_step > 10 {
            errors.push(
                "processing.quality_adjustment_step",
                "must be between 1 and 10",
            );
        }
        if p.min_photo_quality < 1 || p.min_photo_quality > 100 {
            errors.push("processing.min_photo_quality", "must be between 1 and 100");
        }
    }

    fn validate_preferences(&self, errors: &mut ValidationErrors) {
        let tier_exists = |name: &str| self.quality_tiers.iter().any(|t| t.name == name);

        for (folder, tier) in &self.preferences.folder_overrides {
            let field = format!("preferences.folder_overrides[{}]", folder);
            if folder.trim().is_empty() {
                errors.push(field.clone(), "folder path cannot be empty");
            }
            if !tier_exists(tier) {
                errors.push(field, format!("tier '{}' does not exist", tier));
            }
        }

        for (i, exception) in self.preferences.date_range_exceptions.iter().enumerate() {
            let prefix = format!("preferences.date_range_exceptions[{}]", i);
            if exception.end <= exception.start {
                errors.push(format!("{}.end", prefix), "must be after start");
            }
            if !tier_exists(&exception.force_tier) {
                errors.push(
                    format!("{}.force_tier", prefix),
                    format!("tier '{}' does not exist", exception.force_tier),
                );
            }
        }
    }

    /// Build the validated tier catalog
    pub fn catalog(&self) -> Result<TierCatalog, ValidationErrors> {
        TierCatalog::new(self.quality_tiers.clone())
    }

    pub fn storage_limit_bytes(&self) -> u64 {
        self.storage_limit_gb.saturating_mul(BYTES_PER_GB)
    }

    /// Load configuration from file, apply environment overrides, then validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Like [`load`](Self::load), but writes the default document first if the file is missing
    pub fn load_or_init<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            Config::default().save(path)?;
        }
        Self::load(path)
    }

    /// Write the document through a temp file in the same directory, then rename
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let content = self.to_toml()?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| ConfigError::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        env::remove_var("BACKUP_DATA_DIR");
        env::remove_var("BACKUP_STORAGE_LIMIT_GB");
        env::remove_var("BACKUP_MAX_CONCURRENCY");
        env::remove_var("BACKUP_TEMP_DIR");
        env::remove_var("BACKUP_LOG_LEVEL");
        env::remove_var("BACKUP_SPACE_PRESSURE_THRESHOLD");
    }

    // **Property: configuration parsing and environment override**
    //
    // *For any* well-formed document and set of environment overrides, the
    // loaded configuration reflects the document, then the overrides.

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            storage_gb in 1u64..10_000,
            retention in 1u32..365,
            concurrency in 1u32..10,
            threshold in 0.05f64..1.0,
            step in 1u32..10,
            email in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
version = 1
data_dir = "/srv/backup"
storage_limit_gb = {}
retention_days = {}

[processing]
max_concurrency = {}
space_pressure_threshold = {}
quality_adjustment_step = {}

[preferences]
email_notifications = {}
"#,
                storage_gb, retention, concurrency, threshold, step, email
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.storage_limit_gb, storage_gb);
            prop_assert_eq!(config.retention_days, retention);
            prop_assert_eq!(config.processing.max_concurrency, concurrency);
            prop_assert!((config.processing.space_pressure_threshold - threshold).abs() < 1e-9);
            prop_assert_eq!(config.processing.quality_adjustment_step, step);
            prop_assert_eq!(config.preferences.email_notifications, email);
            prop_assert_eq!(config.quality_tiers.len(), 3);
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn prop_env_overrides_storage_limit(
            initial in 1u64..1000,
            override_gb in 1u64..100_000,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let mut config = Config::parse_toml(&format!("storage_limit_gb = {}", initial))
                .expect("Valid TOML");

            env::set_var("BACKUP_STORAGE_LIMIT_GB", override_gb.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.storage_limit_gb, override_gb);
        }

        #[test]
        fn prop_env_overrides_max_concurrency(
            initial in 1u32..10,
            override_workers in 0u32..64,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[processing]\nmax_concurrency = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("BACKUP_MAX_CONCURRENCY", override_workers.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.processing.max_concurrency, override_workers);
        }

        #[test]
        fn prop_env_overrides_space_pressure_threshold(
            override_threshold in 0.01f64..1.0,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let mut config = Config::default();

            env::set_var("BACKUP_SPACE_PRESSURE_THRESHOLD", override_threshold.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert!((config.processing.space_pressure_threshold - override_threshold).abs() < 1e-9);
        }
    }

    #[test]
    fn test_env_overrides_paths_and_log_level() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("BACKUP_DATA_DIR", "/data/archive");
        env::set_var("BACKUP_TEMP_DIR", "/scratch");
        env::set_var("BACKUP_LOG_LEVEL", "DEBUG");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.data_dir, PathBuf::from("/data/archive"));
        assert_eq!(config.processing.temp_dir, PathBuf::from("/scratch"));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("BACKUP_STORAGE_LIMIT_GB", "lots");
        env::set_var("BACKUP_LOG_LEVEL", "chatty");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.storage_limit_gb, 100);
        assert_eq!(config.log_level, "info");
    }

    // Test that missing sections use defaults
    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config, Config::default());
        assert_eq!(config.processing.max_concurrency, 2);
        assert!((config.processing.space_pressure_threshold - 0.9).abs() < 1e-9);
        assert_eq!(config.quality_tiers[0].video_crf, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parses_tiers_and_preferences() {
        let toml_str = r#"
version = 1
data_dir = "/srv/backup"

[[quality_tiers]]
name = "Recent"
age_threshold_days = 90
photo_max_resolution = 20000000
photo_quality = 95
video_max_height = 2160
video_max_fps = 60
video_crf = 18
metadata_level = "full"

[[quality_tiers]]
name = "Old"
age_threshold_days = 999999
photo_max_resolution = 8000000
photo_quality = 80
video_max_height = 720
video_max_fps = 30
video_crf = 28
metadata_level = "minimal"

[preferences.folder_overrides]
"/photos/wedding" = "Recent"

[[preferences.date_range_exceptions]]
start = "2020-06-01T00:00:00Z"
end = "2020-07-01T00:00:00Z"
force_tier = "Recent"
description = "Trip"
"#;
        let config = Config::parse_toml(toml_str).expect("document should parse");

        assert_eq!(config.quality_tiers.len(), 2);
        assert_eq!(config.quality_tiers[1].metadata_level, MetadataLevel::Minimal);
        assert_eq!(
            config.preferences.folder_overrides.get("/photos/wedding").map(String::as_str),
            Some("Recent")
        );
        let exception = &config.preferences.date_range_exceptions[0];
        assert_eq!(exception.description, "Trip");
        assert!(exception.contains("2020-06-15T12:00:00Z".parse().unwrap()));
        assert!(!exception.contains("2020-07-01T00:00:00Z".parse().unwrap()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_aggregates_field_errors() {
        let toml_str = r#"
storage_limit_gb = 0
log_level = "loud"

[processing]
max_concurrency = 20
space_pressure_threshold = 1.5
quality_adjustment_step = 0

[preferences.folder_overrides]
"/photos" = "Nonexistent"
"#;
        let config = Config::parse_toml(toml_str).expect("document should parse");
        let errors = config.validate().unwrap_err();

        assert!(errors.has_field("storage_limit_gb"));
        assert!(errors.has_field("log_level"));
        assert!(errors.has_field("processing.max_concurrency"));
        assert!(errors.has_field("processing.space_pressure_threshold"));
        assert!(errors.has_field("processing.quality_adjustment_step"));
        assert!(errors.has_field("preferences.folder_overrides[/photos]"));
        assert_eq!(errors.len(), 6);
    }

    #[test]
    fn test_unknown_metadata_level_is_a_field_error() {
        let mut config = Config::default();
        config.quality_tiers[1].metadata_level = MetadataLevel::from("everything".to_string());

        let errors = config.validate().unwrap_err();
        assert!(errors.has_field("quality_tiers[1].metadata_level"));
    }

    #[test]
    fn test_date_range_must_end_after_start() {
        let mut config = Config::default();
        config.preferences.date_range_exceptions.push(DateRangeException {
            start: "2021-01-02T00:00:00Z".parse().unwrap(),
            end: "2021-01-01T00:00:00Z".parse().unwrap(),
            force_tier: "Unknown".to_string(),
            description: String::new(),
        });

        let errors = config.validate().unwrap_err();
        assert!(errors.has_field("preferences.date_range_exceptions[0].end"));
        assert!(errors.has_field("preferences.date_range_exceptions[0].force_tier"));
    }

    #[test]
    fn test_save_then_load_round_trips() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.storage_limit_gb = 250;
        config
            .preferences
            .folder_overrides
            .insert("/photos/keep".to_string(), "High Quality (0-12 months)".to_string());
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_or_init_writes_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_rejects_invalid_document() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "retention_days = 0\n").unwrap();

        match Config::load(&path) {
            Err(ConfigError::Invalid(errors)) => assert!(errors.has_field("retention_days")),
            other => panic!("expected validation failure, got {:?}", other),
        }
    }

    #[test]
    fn test_storage_limit_bytes() {
        let config = Config::default();
        assert_eq!(config.storage_limit_bytes(), 100 * 1024 * 1024 * 1024);
    }
}
