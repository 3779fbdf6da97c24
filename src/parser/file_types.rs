//! File-Type Classification
//!
//! Maps file extensions to typed categories, driven by the versioned
//! extension lists in system settings.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::settings::Settings;

/// Typed category of a parsed file
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Video,
    Audio,
    Image,
    Subtitle,
    Metadata,
    Other,
}

impl FileCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Image => "image",
            Self::Subtitle => "subtitle",
            Self::Metadata => "metadata",
            Self::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "video" => Self::Video,
            "audio" => Self::Audio,
            "image" => Self::Image,
            "subtitle" => Self::Subtitle,
            "metadata" => Self::Metadata,
            _ => Self::Other,
        }
    }
}

pub const DEFAULT_VIDEO_TYPES: &str = "mkv,mp4,avi,rmvb,wmv,mov,m2ts,ts,iso,flv";
pub const DEFAULT_AUDIO_TYPES: &str = "mp3,flac,wav,aac,ogg,m4a,wma";
pub const DEFAULT_IMAGE_TYPES: &str = "jpg,jpeg,png,gif,bmp,tiff,webp";
pub const DEFAULT_SUBTITLE_TYPES: &str = "srt,ass,ssa,vtt,sub,idx";
pub const DEFAULT_METADATA_TYPES: &str = "nfo,xml,json,txt";

/// A snapshot of the five configured extension sets.
///
/// Pure value type: classification depends only on the snapshot, never on
/// live settings, so an in-flight task is not reclassified mid-run.
#[derive(Debug, Clone)]
pub struct FileTypeSets {
    video: HashSet<String>,
    audio: HashSet<String>,
    image: HashSet<String>,
    subtitle: HashSet<String>,
    metadata: HashSet<String>,
    /// Settings version the snapshot was taken at
    pub version: i64,
}

fn split_extensions(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect()
}

fn split_or_default(raw: &str, default: &str) -> HashSet<String> {
    let set = split_extensions(raw);
    if set.is_empty() {
        split_extensions(default)
    } else {
        set
    }
}

impl FileTypeSets {
    /// Build a snapshot from settings, falling back to the built-in lists
    /// when a configured list is empty.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            video: split_or_default(&settings.video_file_types, DEFAULT_VIDEO_TYPES),
            audio: split_or_default(&settings.audio_file_types, DEFAULT_AUDIO_TYPES),
            image: split_or_default(&settings.image_file_types, DEFAULT_IMAGE_TYPES),
            subtitle: split_or_default(&settings.subtitle_file_types, DEFAULT_SUBTITLE_TYPES),
            metadata: split_or_default(&settings.metadata_file_types, DEFAULT_METADATA_TYPES),
            version: settings.settings_version,
        }
    }

    /// Built-in defaults, version 1
    pub fn defaults() -> Self {
        Self {
            video: split_extensions(DEFAULT_VIDEO_TYPES),
            audio: split_extensions(DEFAULT_AUDIO_TYPES),
            image: split_extensions(DEFAULT_IMAGE_TYPES),
            subtitle: split_extensions(DEFAULT_SUBTITLE_TYPES),
            metadata: split_extensions(DEFAULT_METADATA_TYPES),
            version: 1,
        }
    }

    /// Classify a file name by its extension.
    ///
    /// The extension is lower-cased and dot-stripped before matching; first
    /// matching set wins, unmatched extensions fall through to `Other`.
    pub fn classify(&self, file_name: &str) -> (FileCategory, String) {
        let extension = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_default();

        let category = if self.video.contains(&extension) {
            FileCategory::Video
        } else if self.audio.contains(&extension) {
            FileCategory::Audio
        } else if self.image.contains(&extension) {
            FileCategory::Image
        } else if self.subtitle.contains(&extension) {
            FileCategory::Subtitle
        } else if self.metadata.contains(&extension) {
            FileCategory::Metadata
        } else {
            FileCategory::Other
        };

        (category, extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sets_with(metadata: &str, subtitle: &str) -> FileTypeSets {
        let mut settings = Settings::default();
        settings.metadata_file_types = metadata.to_string();
        settings.subtitle_file_types = subtitle.to_string();
        FileTypeSets::from_settings(&settings)
    }

    #[test]
    fn test_classify_defaults() {
        let sets = FileTypeSets::defaults();
        assert_eq!(sets.classify("a.mkv").0, FileCategory::Video);
        assert_eq!(sets.classify("a.MP4").0, FileCategory::Video);
        assert_eq!(sets.classify("song.flac").0, FileCategory::Audio);
        assert_eq!(sets.classify("poster.jpg").0, FileCategory::Image);
        assert_eq!(sets.classify("movie.srt").0, FileCategory::Subtitle);
        assert_eq!(sets.classify("movie.nfo").0, FileCategory::Metadata);
        assert_eq!(sets.classify("archive.rar").0, FileCategory::Other);
    }

    #[test]
    fn test_classify_no_extension() {
        let sets = FileTypeSets::defaults();
        let (category, ext) = sets.classify("README");
        assert_eq!(category, FileCategory::Other);
        assert_eq!(ext, "");
    }

    #[test]
    fn test_configured_set_overrides_default() {
        // nfo moved from metadata to subtitle
        let sets = sets_with("xml,json", "nfo,srt,ass");
        assert_eq!(sets.classify("movie.nfo").0, FileCategory::Subtitle);
        assert_eq!(sets.classify("movie.xml").0, FileCategory::Metadata);
    }

    #[test]
    fn test_dot_prefixed_config_entries() {
        let sets = sets_with(".nfo, .xml", "srt");
        assert_eq!(sets.classify("movie.nfo").0, FileCategory::Metadata);
    }

    #[test]
    fn test_empty_list_falls_back_to_default() {
        let mut settings = Settings::default();
        settings.audio_file_types = String::new();
        let sets = FileTypeSets::from_settings(&settings);
        assert_eq!(sets.classify("music.mp3").0, FileCategory::Audio);
    }
}
