//! System Settings
//!
//! Single-row configuration consumed by the classifier, the task builder and
//! the background services. The version counter is bumped only when one of
//! the five extension lists changes; cached parse results key off it.

pub mod logging;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{StrmgenError, StrmgenResult};
use crate::parser::file_types::{
    DEFAULT_AUDIO_TYPES, DEFAULT_IMAGE_TYPES, DEFAULT_METADATA_TYPES, DEFAULT_SUBTITLE_TYPES,
    DEFAULT_VIDEO_TYPES,
};

/// System settings row (singleton)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Monotonic version, bumped only on file-type list changes
    pub settings_version: i64,

    // File-type lists, comma separated
    pub video_file_types: String,
    pub audio_file_types: String,
    pub image_file_types: String,
    pub subtitle_file_types: String,
    pub metadata_file_types: String,

    // Path rewrite for STRM URLs
    pub enable_path_replacement: bool,
    pub replacement_path: String,

    /// Default per-task worker count
    pub download_workers: u32,
    /// Base directory for default task output directories
    pub output_directory: String,

    // Retry policy
    pub failure_retry_count: u32,
    pub retry_interval_seconds: u64,

    // Orphan-task recovery
    pub enable_recovery_periodic_check: bool,
    pub recovery_check_interval: u64,
    pub task_timeout_hours: i64,
    pub heartbeat_timeout_minutes: i64,
    pub activity_check_minutes: i64,
    pub recent_activity_minutes: i64,

    // Logging
    pub log_level: String,
    pub logs_directory: String,
    pub log_retention_days: u32,
    pub enable_sql_logging: bool,

    // Default server references
    pub default_media_server_id: Option<i64>,
    pub default_download_server_id: Option<i64>,

    pub updated_by: Option<i64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            settings_version: 1,
            video_file_types: DEFAULT_VIDEO_TYPES.to_string(),
            audio_file_types: DEFAULT_AUDIO_TYPES.to_string(),
            image_file_types: DEFAULT_IMAGE_TYPES.to_string(),
            subtitle_file_types: DEFAULT_SUBTITLE_TYPES.to_string(),
            metadata_file_types: DEFAULT_METADATA_TYPES.to_string(),
            enable_path_replacement: true,
            replacement_path: "/nas".to_string(),
            download_workers: 1,
            output_directory: "strm_output".to_string(),
            failure_retry_count: 3,
            retry_interval_seconds: 30,
            enable_recovery_periodic_check: true,
            recovery_check_interval: 1800,
            task_timeout_hours: 2,
            heartbeat_timeout_minutes: 10,
            activity_check_minutes: 30,
            recent_activity_minutes: 5,
            log_level: "INFO".to_string(),
            logs_directory: String::new(),
            log_retention_days: 30,
            enable_sql_logging: false,
            default_media_server_id: None,
            default_download_server_id: None,
            updated_by: None,
        }
    }
}

const FILE_TYPE_FIELDS: [(&str, fn(&Settings) -> &str); 5] = [
    ("video_file_types", |s| &s.video_file_types),
    ("audio_file_types", |s| &s.audio_file_types),
    ("image_file_types", |s| &s.image_file_types),
    ("subtitle_file_types", |s| &s.subtitle_file_types),
    ("metadata_file_types", |s| &s.metadata_file_types),
];

impl Settings {
    /// Validate a proposed settings value.
    ///
    /// Checks numeric bounds, that the five extension sets are internally
    /// deduplicated and pairwise disjoint, and that the configured logs
    /// directory is creatable and writable.
    pub fn validate(&self) -> StrmgenResult<()> {
        if self.download_workers < 1 {
            return Err(StrmgenError::Configuration {
                field: "download_workers".to_string(),
                message: "worker count must be at least 1".to_string(),
            });
        }
        if self.failure_retry_count < 1 {
            return Err(StrmgenError::Configuration {
                field: "failure_retry_count".to_string(),
                message: "max attempts must be at least 1".to_string(),
            });
        }
        if self.retry_interval_seconds < 1 {
            return Err(StrmgenError::Configuration {
                field: "retry_interval_seconds".to_string(),
                message: "retry interval must be at least 1 second".to_string(),
            });
        }

        self.validate_file_extensions()?;
        validate_logs_directory(&self.logs_directory)?;
        Ok(())
    }

    fn validate_file_extensions(&self) -> StrmgenResult<()> {
        // extension (lowercase, dot-stripped) -> owning field
        let mut owner: HashMap<String, &'static str> = HashMap::new();

        for (field, getter) in FILE_TYPE_FIELDS {
            let mut seen: HashSet<String> = HashSet::new();
            for raw in getter(self).split(',') {
                let ext = raw.trim().trim_start_matches('.').to_lowercase();
                if ext.is_empty() {
                    continue;
                }
                if !seen.insert(ext.clone()) {
                    return Err(StrmgenError::Configuration {
                        field: field.to_string(),
                        message: format!("extension '{}' is listed twice", ext),
                    });
                }
                if let Some(other) = owner.get(&ext) {
                    return Err(StrmgenError::Configuration {
                        field: field.to_string(),
                        message: format!(
                            "extension '{}' already belongs to {}",
                            ext, other
                        ),
                    });
                }
                owner.insert(ext, field);
            }
        }
        Ok(())
    }

    /// Apply an update over the current value, bumping the version iff one
    /// of the five extension lists changed.
    pub fn apply_update(&self, mut proposal: Settings) -> Settings {
        let lists_changed = FILE_TYPE_FIELDS
            .iter()
            .any(|(_, getter)| getter(self) != getter(&proposal));

        proposal.settings_version = if lists_changed {
            self.settings_version + 1
        } else {
            self.settings_version
        };
        proposal
    }
}

/// Probe that the logs directory can be created and written into.
/// An empty value is allowed and keeps the built-in location.
fn validate_logs_directory(logs_directory: &str) -> StrmgenResult<()> {
    let trimmed = logs_directory.trim();
    if trimmed.is_empty() {
        return Ok(());
    }

    let dir = PathBuf::from(trimmed);
    let configuration_error = |message: String| StrmgenError::Configuration {
        field: "logs_directory".to_string(),
        message,
    };

    std::fs::create_dir_all(&dir)
        .map_err(|e| configuration_error(format!("cannot create '{}': {}", dir.display(), e)))?;

    let probe = dir.join(".write_probe");
    std::fs::write(&probe, b"probe")
        .map_err(|e| configuration_error(format!("cannot write into '{}': {}", dir.display(), e)))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

/// Resolve the output base directory for new tasks
pub fn output_base(settings: &Settings, fallback: &Path) -> PathBuf {
    if settings.output_directory.trim().is_empty() {
        fallback.to_path_buf()
    } else {
        PathBuf::from(settings.output_directory.trim())
    }
}
