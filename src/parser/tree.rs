//! Directory-Tree Parser
//!
//! Parses the textual directory-tree export of a cloud drive into a typed
//! file list. The format is line oriented: leading pipes encode nesting
//! depth, the entry label follows an optional `|-` separator, and a file is
//! any entry whose basename carries an extension.

use serde::{Deserialize, Serialize};

use super::encoding::{decode_index_blob, DecodeError};
use super::file_types::{FileCategory, FileTypeSets};

/// One file emitted by the tree parser
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedEntry {
    /// Absolute virtual path, synthetic export root already stripped
    pub path: String,
    pub file_name: String,
    pub extension: String,
    pub file_type: FileCategory,
    /// Trailing-slash paths are directories; the parser itself only emits
    /// files, but re-typed legacy results may carry directory rows.
    #[serde(default)]
    pub is_directory: bool,
}

/// Per-category entry counts
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypeStats {
    pub total: usize,
    pub video: usize,
    pub audio: usize,
    pub image: usize,
    pub subtitle: usize,
    pub metadata: usize,
    pub other: usize,
}

impl TypeStats {
    pub fn tally(entries: &[ParsedEntry]) -> Self {
        let mut stats = Self::default();
        for entry in entries {
            if entry.is_directory {
                continue;
            }
            stats.total += 1;
            match entry.file_type {
                FileCategory::Video => stats.video += 1,
                FileCategory::Audio => stats.audio += 1,
                FileCategory::Image => stats.image += 1,
                FileCategory::Subtitle => stats.subtitle += 1,
                FileCategory::Metadata => stats.metadata += 1,
                FileCategory::Other => stats.other += 1,
            }
        }
        stats
    }
}

/// Cached result of parsing one upload, stored as JSON on the upload record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseResult {
    pub file_name: String,
    pub parsed_files: Vec<ParsedEntry>,
    pub total_files: usize,
    pub stats: TypeStats,
    /// Settings version the entries were typed at
    pub settings_version: i64,
}

impl ParseResult {
    /// Re-type entries against a newer extension-set snapshot.
    ///
    /// Returns true when at least one entry changed category. Stats and the
    /// version stamp are refreshed either way.
    pub fn refresh_types(&mut self, sets: &FileTypeSets) -> bool {
        let mut changed = false;
        for entry in &mut self.parsed_files {
            if entry.is_directory {
                continue;
            }
            let (file_type, _) = sets.classify(&entry.file_name);
            if entry.file_type != file_type {
                entry.file_type = file_type;
                changed = true;
            }
        }
        self.stats = TypeStats::tally(&self.parsed_files);
        self.settings_version = sets.version;
        changed
    }
}

/// Directory-tree export parser
pub struct TreeParser {
    sets: FileTypeSets,
}

impl TreeParser {
    pub fn new(sets: FileTypeSets) -> Self {
        Self { sets }
    }

    /// Parse a raw index blob into a typed file list.
    ///
    /// Encoding is auto-detected; anything undecodable is the only hard
    /// failure. Malformed lines (missing label, depth jumps) are tolerated.
    pub fn parse(&self, data: &[u8], file_name: &str) -> Result<ParseResult, DecodeError> {
        let text = decode_index_blob(data)?;

        let mut entries = Vec::new();
        let mut path_stack: Vec<String> = Vec::new();

        for raw_line in text.lines() {
            let line = raw_line.trim_start_matches('\u{feff}').trim_end();

            let depth = line.matches('|').count();

            // Label follows the last `|-` separator; bare-pipe lines carry
            // the label directly after the pipes.
            let label = match line.rfind("|-") {
                Some(idx) => line[idx + 2..].trim(),
                None => line.trim_start_matches('|').trim(),
            };
            if label.is_empty() {
                continue;
            }

            // Maintain the depth-indexed path stack
            while path_stack.len() > depth {
                path_stack.pop();
            }
            if path_stack.len() == depth {
                path_stack.pop();
            }
            // A depth jump of more than one level is padded rather than
            // aborting the parse
            while path_stack.len() + 1 < depth {
                path_stack.push(String::new());
            }
            path_stack.push(label.to_string());

            let full_path = format!("/{}", path_stack.join("/"));

            // Entries without an extension are containers
            let file_name = match full_path.rsplit('/').next() {
                Some(name) if name.contains('.') => name.to_string(),
                _ => continue,
            };

            let path = strip_export_root(&full_path);
            let (file_type, extension) = self.sets.classify(&file_name);

            entries.push(ParsedEntry {
                path,
                file_name,
                extension,
                file_type,
                is_directory: false,
            });
        }

        let stats = TypeStats::tally(&entries);
        Ok(ParseResult {
            file_name: file_name.to_string(),
            total_files: entries.len(),
            parsed_files: entries,
            stats,
            settings_version: self.sets.version,
        })
    }
}

/// Remove the synthetic top-level component the export wraps everything in
/// (typically the drive name).
fn strip_export_root(path: &str) -> String {
    if let Some(first) = path.find('/') {
        if let Some(second) = path[first + 1..].find('/') {
            return path[first + 1 + second..].to_string();
        }
    }
    path.to_string()
}

/// Filter a parsed file list by category, keyword, or path prefix.
pub fn filter_files<'a>(
    files: &'a [ParsedEntry],
    file_type: Option<FileCategory>,
    keyword: Option<&str>,
    path_prefix: Option<&str>,
) -> Vec<&'a ParsedEntry> {
    files
        .iter()
        .filter(|f| file_type.map_or(true, |t| f.file_type == t))
        .filter(|f| {
            keyword.map_or(true, |k| f.path.to_lowercase().contains(&k.to_lowercase()))
        })
        .filter(|f| path_prefix.map_or(true, |p| f.path.starts_with(p)))
        .collect()
}
