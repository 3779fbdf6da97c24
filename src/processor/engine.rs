//! Sub-Task Handlers
//!
//! The two handler classes the worker pool dispatches to: the STRM writer
//! materialises a stub file containing a streaming URL, the resource
//! downloader copies the file body from the download server. Handlers are
//! stateless with respect to the queue; everything they need arrives in the
//! environment they are built with.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::db::{Db, DownloadLogEntry, MediaServer, StrmLogEntry};
use crate::parser::FileCategory;
use crate::processor::model::{now_local, ProcessKind, SubTask};
use crate::processor::progress::{compute_speed, format_size, format_speed};

/// Categorised handler failure; the category shapes the recorded error
/// message, the retry policy treats all of them alike.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("http-status {status}: {message}")]
    HttpStatus { status: u16, message: String },
    #[error("network: {0}")]
    Network(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("filesystem: {0}")]
    Io(String),
    #[error("unknown: {0}")]
    Unknown(String),
}

impl HandlerError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            Self::HttpStatus {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_connect() || err.is_request() {
            Self::Network(err.to_string())
        } else {
            Self::Unknown(err.to_string())
        }
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// What a successful handler run produced
#[derive(Debug)]
pub struct HandlerOutcome {
    pub target_path: PathBuf,
    pub file_size: Option<u64>,
    pub duration: f64,
    pub speed: Option<f64>,
}

/// One unit of sub-task work. Implementations must be safe to call from any
/// batch slot concurrently.
#[async_trait]
pub trait SubTaskHandler: Send + Sync {
    fn kind(&self) -> ProcessKind;
    /// Short label for task-log lines
    fn label(&self) -> &'static str;
    async fn execute(&self, sub: &SubTask, worker: usize) -> Result<HandlerOutcome, HandlerError>;
}

/// Replace the first non-empty path segment with the configured prefix.
fn rewrite_base_path(path: &str, replacement: &str) -> String {
    let replacement = replacement.trim_matches('/');
    let mut parts: Vec<&str> = path.split('/').collect();
    match parts.iter().position(|p| !p.is_empty()) {
        Some(first) => {
            parts[first] = replacement;
            parts.join("/")
        }
        None => path.to_string(),
    }
}

/// Percent-encode a virtual path segment-wise, keeping the separators.
fn quote_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Resolve a virtual path under the task output directory.
fn target_for(output_dir: &Path, virtual_path: &str) -> PathBuf {
    output_dir.join(virtual_path.trim_start_matches('/'))
}

async fn ensure_parent_dirs(path: &Path) -> Result<(), HandlerError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

// ============================================================================
// STRM writer
// ============================================================================

/// Writes STRM stubs: a single line holding the streaming URL.
pub struct StrmWriter {
    db: Arc<Db>,
    task_id: i64,
    server: MediaServer,
    output_dir: PathBuf,
    enable_path_replacement: bool,
    replacement_path: String,
}

impl StrmWriter {
    pub fn new(
        db: Arc<Db>,
        task_id: i64,
        server: MediaServer,
        output_dir: PathBuf,
        enable_path_replacement: bool,
        replacement_path: String,
    ) -> Self {
        Self {
            db,
            task_id,
            server,
            output_dir,
            enable_path_replacement,
            replacement_path,
        }
    }

    /// The URL written into the stub
    pub fn strm_url(&self, source_path: &str) -> String {
        let path = if self.enable_path_replacement {
            rewrite_base_path(source_path, &self.replacement_path)
        } else {
            source_path.to_string()
        };
        format!("{}{}", self.server.base_url, quote_path(&path))
    }

    fn log_strm(&self, sub: &SubTask, target: Option<&Path>, message: String, error: Option<String>, duration: f64) {
        let entry = StrmLogEntry {
            task_id: self.task_id,
            source_path: sub.source_path.clone(),
            target_path: target.map(|p| p.to_string_lossy().to_string()),
            file_type: sub.file_type,
            is_success: error.is_none(),
            log_level: if error.is_none() { "INFO" } else { "ERROR" }.to_string(),
            log_message: message,
            error_message: error,
            generation_time: Some(duration),
            created_at: now_local(),
        };
        if let Err(e) = self.db.insert_strm_log(&entry) {
            tracing::error!("Failed to record strm log: {}", e);
        }
    }
}

#[async_trait]
impl SubTaskHandler for StrmWriter {
    fn kind(&self) -> ProcessKind {
        ProcessKind::StrmGeneration
    }

    fn label(&self) -> &'static str {
        "STRM generation"
    }

    async fn execute(&self, sub: &SubTask, worker: usize) -> Result<HandlerOutcome, HandlerError> {
        let started = Instant::now();
        let url = self.strm_url(&sub.source_path);

        let target = target_for(&self.output_dir, &sub.source_path).with_extension("strm");

        let result: Result<(), HandlerError> = async {
            ensure_parent_dirs(&target).await?;
            tokio::fs::write(&target, url.as_bytes()).await?;
            Ok(())
        }
        .await;

        let duration = started.elapsed().as_secs_f64();
        match result {
            Ok(()) => {
                self.log_strm(
                    sub,
                    Some(target.as_path()),
                    format!(
                        "[worker {}] STRM file generated: {} ({:.3}s)",
                        worker,
                        target.display(),
                        duration
                    ),
                    None,
                    duration,
                );
                Ok(HandlerOutcome {
                    target_path: target,
                    file_size: Some(url.len() as u64),
                    duration,
                    speed: None,
                })
            }
            Err(e) => {
                self.log_strm(
                    sub,
                    Some(target.as_path()),
                    format!(
                        "[worker {}] STRM generation failed: {} ({:.3}s)",
                        worker, e, duration
                    ),
                    Some(e.to_string()),
                    duration,
                );
                Err(e)
            }
        }
    }
}

// ============================================================================
// Resource downloader
// ============================================================================

/// Downloads non-video assets byte-for-byte from the download server.
pub struct ResourceDownloader {
    db: Arc<Db>,
    task_id: i64,
    server: MediaServer,
    output_dir: PathBuf,
    http: reqwest::Client,
}

impl ResourceDownloader {
    pub fn new(
        db: Arc<Db>,
        task_id: i64,
        server: MediaServer,
        output_dir: PathBuf,
        http: reqwest::Client,
    ) -> Self {
        Self {
            db,
            task_id,
            server,
            output_dir,
            http,
        }
    }

    /// Download URL for a virtual path. Intentionally no path rewrite here:
    /// rewriting applies to streaming URLs only.
    pub fn download_url(&self, source_path: &str) -> String {
        format!("{}{}", self.server.base_url, source_path)
    }

    fn log_download(
        &self,
        sub: &SubTask,
        target: Option<&Path>,
        message: String,
        error: Option<String>,
        size: Option<u64>,
        duration: f64,
        speed: Option<f64>,
    ) {
        let entry = DownloadLogEntry {
            task_id: self.task_id,
            file_path: sub.source_path.clone(),
            target_path: target.map(|p| p.to_string_lossy().to_string()),
            file_type: sub.file_type,
            file_size: size.map(|s| s as i64),
            download_time: Some(duration),
            download_speed: speed,
            is_success: error.is_none(),
            log_level: if error.is_none() { "INFO" } else { "ERROR" }.to_string(),
            log_message: message,
            error_message: error,
            created_at: now_local(),
        };
        if let Err(e) = self.db.insert_download_log(&entry) {
            tracing::error!("Failed to record download log: {}", e);
        }
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, HandlerError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(HandlerError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(HandlerError::HttpStatus {
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            });
        }

        let body = response.bytes().await.map_err(HandlerError::from_reqwest)?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl SubTaskHandler for ResourceDownloader {
    fn kind(&self) -> ProcessKind {
        ProcessKind::ResourceDownload
    }

    fn label(&self) -> &'static str {
        "resource download"
    }

    async fn execute(&self, sub: &SubTask, worker: usize) -> Result<HandlerOutcome, HandlerError> {
        let started = Instant::now();
        let url = self.download_url(&sub.source_path);
        let target = target_for(&self.output_dir, &sub.source_path);

        let result: Result<u64, HandlerError> = async {
            let body = self.fetch(&url).await?;
            ensure_parent_dirs(&target).await?;
            tokio::fs::write(&target, &body).await?;
            Ok(body.len() as u64)
        }
        .await;

        let duration = started.elapsed().as_secs_f64();
        match result {
            Ok(size) => {
                let speed = compute_speed(Some(size), duration);
                let speed_str = speed.map(format_speed).unwrap_or_else(|| "n/a".to_string());
                self.log_download(
                    sub,
                    Some(target.as_path()),
                    format!(
                        "[worker {}] Resource downloaded: {} {} {} ({:.3}s)",
                        worker,
                        target.display(),
                        format_size(size),
                        speed_str,
                        duration
                    ),
                    None,
                    Some(size),
                    duration,
                    speed,
                );
                Ok(HandlerOutcome {
                    target_path: target,
                    file_size: Some(size),
                    duration,
                    speed,
                })
            }
            Err(e) => {
                self.log_download(
                    sub,
                    None,
                    format!(
                        "[worker {}] Resource download failed: {} ({:.3}s)",
                        worker, e, duration
                    ),
                    Some(e.to_string()),
                    None,
                    duration,
                    None,
                );
                Err(e)
            }
        }
    }
}

/// HTTP client shared by all downloader handlers: redirects followed,
/// 10 s connect / 60 s total timeout.
pub fn create_download_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .timeout(std::time::Duration::from_secs(60))
        .build()
        .expect("Failed to create HTTP client")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ServerKind, ServerStatus};

    fn server(base_url: &str) -> MediaServer {
        MediaServer {
            id: 1,
            name: "test".to_string(),
            server_kind: ServerKind::Http,
            base_url: base_url.to_string(),
            description: None,
            auth_required: false,
            username: None,
            password: None,
            status: ServerStatus::Unknown,
            created_by: 1,
            created_at: now_local(),
        }
    }

    fn writer(rewrite: bool, prefix: &str) -> StrmWriter {
        StrmWriter::new(
            Arc::new(Db::open_in_memory().unwrap()),
            1,
            server("http://m"),
            PathBuf::from("/o"),
            rewrite,
            prefix.to_string(),
        )
    }

    #[test]
    fn test_rewrite_base_path() {
        assert_eq!(rewrite_base_path("/nas/shows/e1.mkv", "nas2"), "/nas2/shows/e1.mkv");
        assert_eq!(rewrite_base_path("/nas/shows/e1.mkv", "/nas2/"), "/nas2/shows/e1.mkv");
        assert_eq!(rewrite_base_path("/", "nas2"), "/");
    }

    #[test]
    fn test_strm_url_without_rewrite() {
        let writer = writer(false, "/nas");
        assert_eq!(writer.strm_url("/movies/a.mkv"), "http://m/movies/a.mkv");
    }

    #[test]
    fn test_strm_url_with_rewrite() {
        let writer = writer(true, "nas2");
        // the first segment is replaced, the rest of the path is untouched
        assert_eq!(writer.strm_url("/nas/movies/a.mkv"), "http://m/nas2/movies/a.mkv");
        assert_eq!(writer.strm_url("/movies/a.mkv"), "http://m/nas2/a.mkv");
    }

    #[test]
    fn test_strm_url_quotes_unicode() {
        let writer = writer(false, "/nas");
        let url = writer.strm_url("/电影/a b.mkv");
        assert!(url.starts_with("http://m/"));
        assert!(!url.contains(' '));
        assert!(!url.contains('电'));
    }

    #[test]
    fn test_target_path_strm_extension() {
        let target = target_for(Path::new("/o"), "/movies/a.mkv").with_extension("strm");
        assert_eq!(target, PathBuf::from("/o/movies/a.strm"));
    }

    #[test]
    fn test_download_url_has_no_rewrite() {
        let downloader = ResourceDownloader::new(
            Arc::new(Db::open_in_memory().unwrap()),
            1,
            server("http://d"),
            PathBuf::from("/o"),
            create_download_client(),
        );
        assert_eq!(downloader.download_url("/show/poster.jpg"), "http://d/show/poster.jpg");
    }
}
