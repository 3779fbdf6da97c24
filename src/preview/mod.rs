//! Preview & Directory View
//!
//! Read-side views over sub-task results: the virtual directory tree is
//! reconstructed from stored source paths, and individual artifacts are
//! previewed by their *target* extension.

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;

use crate::db::Db;
use crate::error::{StrmgenError, StrmgenResult};
use crate::processor::model::SubTaskStatus;

const TEXT_PREVIEW_MAX_BYTES: u64 = 1024 * 1024;
const TEXT_PREVIEW_MAX_CHARS: usize = 10_000;

const TEXT_EXTENSIONS: [&str; 9] = [
    "txt", "nfo", "xml", "json", "srt", "ass", "ssa", "vtt", "sub",
];
const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "bmp", "webp"];

#[derive(Debug, Serialize, PartialEq)]
pub struct DirectoryItem {
    pub file_name: String,
    pub is_directory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DirectoryListing {
    pub directory_path: String,
    pub items: Vec<DirectoryItem>,
    pub file_count: usize,
    pub directory_count: usize,
}

/// List one level of the virtual tree: child directories are the unique
/// first segments under the prefix, files are sub-tasks whose source sits
/// directly in it. Directories first, both halves sorted lexicographically.
pub fn directory_content(db: &Db, task_id: i64, directory_path: &str) -> StrmgenResult<DirectoryListing> {
    let mut normalized = directory_path.trim().to_string();
    if !normalized.starts_with('/') {
        normalized.insert(0, '/');
    }
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }

    let prefix = if normalized == "/" {
        String::new()
    } else {
        format!("{}/", normalized.trim_start_matches('/'))
    };

    let mut directories: BTreeSet<String> = BTreeSet::new();
    let mut files: Vec<DirectoryItem> = Vec::new();

    for sub in db.sub_tasks_for_task(task_id)? {
        let relative = match sub.source_path.trim_start_matches('/').strip_prefix(&prefix) {
            Some(rest) if !rest.is_empty() => rest,
            _ => continue,
        };

        match relative.split_once('/') {
            Some((first, _)) => {
                directories.insert(first.to_string());
            }
            None => files.push(DirectoryItem {
                file_name: relative.to_string(),
                is_directory: false,
                file_size: sub.file_size,
                is_success: Some(sub.status == SubTaskStatus::Completed),
                file_type: Some(sub.file_type.as_str().to_string()),
            }),
        }
    }

    files.sort_by(|a, b| a.file_name.cmp(&b.file_name));

    let directory_count = directories.len();
    let file_count = files.len();

    let mut items: Vec<DirectoryItem> = directories
        .into_iter()
        .map(|name| DirectoryItem {
            file_name: name,
            is_directory: true,
            file_size: None,
            is_success: None,
            file_type: None,
        })
        .collect();
    items.extend(files);

    Ok(DirectoryListing {
        directory_path: normalized,
        items,
        file_count,
        directory_count,
    })
}

#[derive(Debug, Serialize)]
pub struct FilePreview {
    pub file_path: String,
    pub target_path: Option<String>,
    pub file_type: String,
    pub file_extension: String,
    pub file_size: Option<i64>,
    pub status: String,
    /// "strm" | "text" | "image" | "info" | "error"
    pub preview_type: &'static str,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoded_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Preview the artifact of one sub-task, dispatching on the target
/// extension (a video's artifact is a `.strm` stub, not a video).
pub fn file_preview(db: &Db, task_id: i64, source_path: &str) -> StrmgenResult<FilePreview> {
    let sub = db
        .get_sub_task_by_source(task_id, source_path)?
        .ok_or_else(|| StrmgenError::SubTaskNotFound(source_path.to_string()))?;

    let mut preview = FilePreview {
        file_path: source_path.to_string(),
        target_path: sub.target_path.clone(),
        file_type: sub.file_type.as_str().to_string(),
        file_extension: String::new(),
        file_size: sub.file_size,
        status: sub.status.as_str().to_string(),
        preview_type: "info",
        content: None,
        decoded_content: None,
        error: None,
    };

    if sub.status != SubTaskStatus::Completed {
        preview.preview_type = "error";
        preview.error = Some(
            sub.error_message
                .unwrap_or_else(|| "file has not been processed yet".to_string()),
        );
        return Ok(preview);
    }

    let target = match sub.target_path.as_deref() {
        Some(target) => target.to_string(),
        None => {
            preview.preview_type = "error";
            preview.error = Some("no target path recorded".to_string());
            return Ok(preview);
        }
    };

    let extension = Path::new(&target)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    preview.file_extension = format!(".{}", extension);

    if extension == "strm" {
        preview_strm(&target, &mut preview);
    } else if TEXT_EXTENSIONS.contains(&extension.as_str()) {
        preview_text(&target, &mut preview);
    } else if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        preview_image(&target, &mut preview);
    }

    Ok(preview)
}

/// STRM stubs hold a single URL; both the raw and the percent-decoded form
/// are returned.
fn preview_strm(target: &str, preview: &mut FilePreview) {
    match std::fs::read_to_string(target) {
        Ok(content) => {
            let content = content.trim().to_string();
            let decoded = urlencoding::decode(&content)
                .map(|d| d.into_owned())
                .unwrap_or_else(|_| content.clone());
            preview.preview_type = "strm";
            preview.decoded_content = Some(decoded);
            preview.content = Some(content);
        }
        Err(e) => {
            preview.preview_type = "error";
            preview.error = Some(format!("cannot read STRM file: {}", e));
        }
    }
}

fn preview_text(target: &str, preview: &mut FilePreview) {
    let metadata = match std::fs::metadata(target) {
        Ok(m) => m,
        Err(e) => {
            preview.preview_type = "error";
            preview.error = Some(format!("cannot stat file: {}", e));
            return;
        }
    };
    if metadata.len() > TEXT_PREVIEW_MAX_BYTES {
        preview.error = Some("file too large to preview (over 1 MiB)".to_string());
        return;
    }

    let bytes = match std::fs::read(target) {
        Ok(bytes) => bytes,
        Err(e) => {
            preview.preview_type = "error";
            preview.error = Some(format!("cannot read file: {}", e));
            return;
        }
    };

    // UTF-8 first, then the same legacy fallbacks as the index parser
    let mut content = match crate::parser::encoding::decode_index_blob(&bytes) {
        Ok(text) => text,
        Err(_) => encoding_rs::WINDOWS_1252.decode(&bytes).0.into_owned(),
    };

    if content.chars().count() > TEXT_PREVIEW_MAX_CHARS {
        content = content.chars().take(TEXT_PREVIEW_MAX_CHARS).collect::<String>()
            + "\n\n... (content truncated)";
    }
    preview.preview_type = "text";
    preview.content = Some(content);
}

/// Images return metadata plus a file reference; the bytes are served by a
/// separate endpoint.
fn preview_image(target: &str, preview: &mut FilePreview) {
    match std::fs::metadata(target) {
        Ok(metadata) => {
            preview.preview_type = "image";
            preview.file_size = Some(metadata.len() as i64);
            preview.content = Some(target.to_string());
        }
        Err(e) => {
            preview.preview_type = "error";
            preview.error = Some(format!("cannot stat image: {}", e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::FileCategory;
    use crate::processor::model::{now_local, ProcessKind, SubTask, Task, TaskStatus};

    fn seed_task(db: &Db, paths: &[&str]) -> i64 {
        let mut task = Task {
            id: 0,
            name: "preview".to_string(),
            status: TaskStatus::Running,
            server_id: 1,
            download_server_id: None,
            source_record_id: 1,
            output_dir: "/tmp/out".to_string(),
            total_files: paths.len() as i64,
            processed_files: 0,
            success_files: 0,
            failed_files: 0,
            start_time: Some(now_local()),
            end_time: None,
            worker_count: 1,
            log_content: String::new(),
            last_heartbeat: None,
            run_duration: None,
            created_by: 1,
            created_at: now_local(),
        };
        task.id = db.insert_task(&task).unwrap();

        let subs: Vec<SubTask> = paths
            .iter()
            .map(|path| SubTask {
                id: 0,
                task_id: task.id,
                source_path: path.to_string(),
                target_path: None,
                file_type: FileCategory::Video,
                process_kind: ProcessKind::StrmGeneration,
                status: SubTaskStatus::Completed,
                priority: 0,
                attempts: 0,
                max_attempts: 3,
                file_size: Some(10),
                download_started: None,
                download_completed: None,
                duration: None,
                speed: None,
                worker_id: None,
                error_message: None,
                retry_after: None,
                updated_at: now_local(),
            })
            .collect();
        db.insert_sub_tasks(&task, &subs).unwrap();
        task.id
    }

    #[test]
    fn test_root_listing_directories_first_sorted() {
        let db = Db::open_in_memory().unwrap();
        let task_id = seed_task(
            &db,
            &["/zeta/a.mkv", "/alpha/b.mkv", "/root.mkv", "/alpha/c/d.mkv"],
        );

        let listing = directory_content(&db, task_id, "/").unwrap();
        let names: Vec<_> = listing.items.iter().map(|i| i.file_name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta", "root.mkv"]);
        assert_eq!(listing.directory_count, 2);
        assert_eq!(listing.file_count, 1);
    }

    #[test]
    fn test_subdirectory_listing() {
        let db = Db::open_in_memory().unwrap();
        let task_id = seed_task(&db, &["/alpha/b.mkv", "/alpha/c/d.mkv", "/zeta/e.mkv"]);

        let listing = directory_content(&db, task_id, "/alpha").unwrap();
        let names: Vec<_> = listing.items.iter().map(|i| i.file_name.as_str()).collect();
        assert_eq!(names, vec!["c", "b.mkv"]);
        assert_eq!(listing.directory_path, "/alpha");
    }

    #[test]
    fn test_preview_missing_sub_task() {
        let db = Db::open_in_memory().unwrap();
        let task_id = seed_task(&db, &["/a.mkv"]);
        let err = file_preview(&db, task_id, "/missing.mkv").unwrap_err();
        assert!(matches!(err, StrmgenError::SubTaskNotFound(_)));
    }

    #[test]
    fn test_preview_strm_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let strm = dir.path().join("a.strm");
        std::fs::write(&strm, "http://m/%E7%94%B5%E5%BD%B1/a.mkv").unwrap();

        let db = Db::open_in_memory().unwrap();
        let task_id = seed_task(&db, &["/a.mkv"]);
        let mut sub = db.get_sub_task_by_source(task_id, "/a.mkv").unwrap().unwrap();
        sub.target_path = Some(strm.to_string_lossy().to_string());
        db.save_sub_task(&sub).unwrap();

        let preview = file_preview(&db, task_id, "/a.mkv").unwrap();
        assert_eq!(preview.preview_type, "strm");
        assert_eq!(preview.content.as_deref(), Some("http://m/%E7%94%B5%E5%BD%B1/a.mkv"));
        assert_eq!(preview.decoded_content.as_deref(), Some("http://m/电影/a.mkv"));
    }
}
