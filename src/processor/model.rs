//! Task Aggregate Model
//!
//! A parent `Task` and its child `SubTask`s: the persistent queue the
//! worker pool drains. Counters on the parent are a projection of sub-task
//! state, refreshed at terminal reconciliation.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};

use crate::parser::FileCategory;

/// All stored datetimes are naive local time.
pub fn now_local() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Convert an aware datetime to the stored naive-local convention.
pub fn normalize_datetime<Tz: TimeZone>(dt: DateTime<Tz>) -> NaiveDateTime {
    dt.with_timezone(&Local).naive_local()
}

/// Parent task state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "canceled" => Self::Canceled,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Cancel is permitted only before the task has reached a terminal state
    pub fn can_cancel(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Continue is the one transition out of `canceled`
    pub fn can_continue(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// Sub-task state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubTaskStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    Canceled,
    Retry,
}

impl SubTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Retry => "retry",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "downloading" => Self::Downloading,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "canceled" => Self::Canceled,
            "retry" => Self::Retry,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// How a sub-task's file is materialised
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    /// Write a STRM stub pointing at the media server
    StrmGeneration,
    /// Download the file body from the download server
    ResourceDownload,
    /// Reserved; never written by any current code path
    PendingWait,
}

impl ProcessKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StrmGeneration => "strm_generation",
            Self::ResourceDownload => "resource_download",
            Self::PendingWait => "pending_wait",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "strm_generation" => Self::StrmGeneration,
            "resource_download" => Self::ResourceDownload,
            _ => Self::PendingWait,
        }
    }

    /// Process kind assigned at sub-task creation; `other` files are not
    /// materialised at all and get no sub-task.
    pub fn for_category(category: FileCategory) -> Option<Self> {
        match category {
            FileCategory::Video => Some(Self::StrmGeneration),
            FileCategory::Audio
            | FileCategory::Image
            | FileCategory::Subtitle
            | FileCategory::Metadata => Some(Self::ResourceDownload),
            FileCategory::Other => None,
        }
    }
}

/// Parent task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub status: TaskStatus,
    /// Media server the STRM URLs point at
    pub server_id: i64,
    /// Download server for resource files; media server doubles when absent
    pub download_server_id: Option<i64>,
    /// Upload record the file list came from
    pub source_record_id: i64,
    pub output_dir: String,
    pub total_files: i64,
    pub processed_files: i64,
    pub success_files: i64,
    pub failed_files: i64,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    /// Batch width for the worker pool
    pub worker_count: u32,
    /// Append-only task log text
    pub log_content: String,
    pub last_heartbeat: Option<NaiveDateTime>,
    pub run_duration: Option<f64>,
    pub created_by: i64,
    pub created_at: NaiveDateTime,
}

/// Unit of work for exactly one file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: i64,
    pub task_id: i64,
    /// Virtual path within the parsed tree
    pub source_path: String,
    /// Resolved local path; set on success
    pub target_path: Option<String>,
    pub file_type: FileCategory,
    pub process_kind: ProcessKind,
    pub status: SubTaskStatus,
    pub priority: i64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub file_size: Option<i64>,
    pub download_started: Option<NaiveDateTime>,
    pub download_completed: Option<NaiveDateTime>,
    pub duration: Option<f64>,
    pub speed: Option<f64>,
    pub worker_id: Option<String>,
    pub error_message: Option<String>,
    pub retry_after: Option<NaiveDateTime>,
    pub updated_at: NaiveDateTime,
}

impl SubTask {
    /// Short display name for log lines
    pub fn file_name(&self) -> &str {
        self.source_path.rsplit('/').next().unwrap_or(&self.source_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Canceled,
        ] {
            assert_eq!(TaskStatus::from_str(status.as_str()), status);
        }
    }

    #[test]
    fn test_cancel_and_continue_gates() {
        assert!(TaskStatus::Pending.can_cancel());
        assert!(TaskStatus::Running.can_cancel());
        assert!(!TaskStatus::Completed.can_cancel());
        assert!(!TaskStatus::Canceled.can_cancel());

        assert!(TaskStatus::Canceled.can_continue());
        assert!(!TaskStatus::Running.can_continue());
    }

    #[test]
    fn test_process_kind_assignment() {
        assert_eq!(
            ProcessKind::for_category(FileCategory::Video),
            Some(ProcessKind::StrmGeneration)
        );
        for category in [
            FileCategory::Audio,
            FileCategory::Image,
            FileCategory::Subtitle,
            FileCategory::Metadata,
        ] {
            assert_eq!(
                ProcessKind::for_category(category),
                Some(ProcessKind::ResourceDownload)
            );
        }
        assert_eq!(ProcessKind::for_category(FileCategory::Other), None);
    }

    #[test]
    fn test_normalize_strips_timezone() {
        let aware = chrono::Utc::now();
        let naive = normalize_datetime(aware);
        let local = aware.with_timezone(&Local).naive_local();
        assert_eq!(naive, local);
    }
}
