//! Task API Routes
//!
//! Task lifecycle endpoints plus the read-side views: sub-task listing,
//! merged log retrieval, directory tree and file preview.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{StrmgenError, StrmgenResult};
use crate::parser::FileCategory;
use crate::preview;
use crate::processor::actions::{self, CancelOutcome, ContinueOutcome, CreateTaskParams};
use crate::processor::model::{SubTask, SubTaskStatus, Task, TaskStatus};
use crate::processor::progress::progress_percent;
use crate::processor::recovery::{self, RecoveryReport};
use crate::processor::task_log::parse_log_line;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_task).get(list_tasks))
        .route("/recover", post(recover_tasks))
        .route("/:id", get(get_task).delete(delete_task))
        .route("/:id/cancel", post(cancel_task))
        .route("/:id/continue", post(continue_task))
        .route("/:id/files", get(list_task_files))
        .route("/:id/logs", get(get_task_logs))
        .route("/:id/directory", get(get_directory_content))
        .route("/:id/preview", get(get_file_preview))
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize)]
struct TaskSummary {
    id: i64,
    name: String,
    status: TaskStatus,
    total_files: i64,
    processed_files: i64,
    success_files: i64,
    failed_files: i64,
    progress: u32,
    start_time: Option<NaiveDateTime>,
    end_time: Option<NaiveDateTime>,
}

#[derive(Serialize)]
struct TaskListResponse {
    tasks: Vec<TaskSummary>,
    total: u64,
    page: u32,
    page_size: u32,
}

#[derive(Serialize)]
struct TaskDetail {
    #[serde(flatten)]
    summary: TaskSummary,
    output_dir: String,
    worker_count: u32,
    server_id: i64,
    download_server_id: Option<i64>,
    source_record_id: i64,
    last_heartbeat: Option<NaiveDateTime>,
    run_duration: Option<f64>,
    strm_completed: i64,
    strm_failed: i64,
    resource_completed: i64,
    resource_failed: i64,
    pending: i64,
    downloading: i64,
    retry: i64,
}

#[derive(Serialize)]
struct CreateTaskResponse {
    task_id: i64,
    name: String,
    status: TaskStatus,
}

#[derive(Serialize)]
struct SubTaskListResponse {
    files: Vec<SubTask>,
    total: u64,
    page: u32,
    page_size: u32,
}

#[derive(Serialize)]
struct LogEntry {
    /// "task" | "download" | "strm"
    stream: &'static str,
    content: String,
    timestamp: Option<NaiveDateTime>,
    level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    is_success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

#[derive(Serialize)]
struct TaskLogsResponse {
    logs: Vec<LogEntry>,
    total: usize,
    page: u32,
    page_size: u32,
    raw_content: String,
}

// ============================================================================
// Request Types
// ============================================================================

#[derive(Deserialize)]
struct CreateTaskRequest {
    record_id: i64,
    server_id: i64,
    #[serde(default)]
    download_server_id: Option<i64>,
    #[serde(default)]
    output_dir: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    worker_count: Option<u32>,
}

#[derive(Deserialize)]
struct ListTasksQuery {
    page: Option<u32>,
    page_size: Option<u32>,
    status: Option<String>,
    search: Option<String>,
}

#[derive(Deserialize)]
struct ListFilesQuery {
    page: Option<u32>,
    page_size: Option<u32>,
    file_type: Option<String>,
    status: Option<String>,
    search: Option<String>,
}

#[derive(Deserialize)]
struct LogsQuery {
    page: Option<u32>,
    page_size: Option<u32>,
    level: Option<String>,
    search: Option<String>,
    /// "task" | "download" | "strm"
    log_type: Option<String>,
}

#[derive(Deserialize)]
struct DirectoryQuery {
    #[serde(default = "default_path")]
    path: String,
}

#[derive(Deserialize)]
struct PreviewQuery {
    path: String,
}

fn default_path() -> String {
    "/".to_string()
}

fn summarize(task: &Task, processed: i64, success: i64, failed: i64, total: i64) -> TaskSummary {
    TaskSummary {
        id: task.id,
        name: task.name.clone(),
        status: task.status,
        total_files: total,
        processed_files: processed,
        success_files: success,
        failed_files: failed,
        progress: progress_percent(processed, total),
        start_time: task.start_time,
        end_time: task.end_time,
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/tasks - create a task and start it asynchronously
async fn create_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateTaskRequest>,
) -> StrmgenResult<Json<CreateTaskResponse>> {
    let user_id = super::user_id_from(&headers);

    let task = actions::create_task(
        &state.db,
        &state.config.storage.output_base,
        CreateTaskParams {
            record_id: payload.record_id,
            server_id: payload.server_id,
            download_server_id: payload.download_server_id,
            output_dir: payload.output_dir,
            name: payload.name,
            worker_count: payload.worker_count,
            created_by: user_id,
        },
    )?;

    let processor = Arc::clone(&state.processor);
    let task_id = task.id;
    tokio::spawn(async move {
        if let Err(e) = actions::start_task(&processor, task_id, user_id).await {
            tracing::error!("Task {} failed to start: {}", task_id, e);
        }
    });

    Ok(Json(CreateTaskResponse {
        task_id: task.id,
        name: task.name,
        status: task.status,
    }))
}

/// GET /api/tasks - paginated list with projected counters
async fn list_tasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListTasksQuery>,
) -> StrmgenResult<Json<TaskListResponse>> {
    let user_id = super::user_id_from(&headers);
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(10).clamp(1, 100);
    let status = query
        .status
        .as_deref()
        .map(|s| TaskStatus::from_str(&s.to_lowercase()));

    let (tasks, total) = state
        .db
        .list_tasks_async(user_id, status, query.search.clone(), page, page_size)
        .await?;

    // Counters are a projection of sub-task state, not the stored totals
    let mut summaries = Vec::with_capacity(tasks.len());
    for task in &tasks {
        let counts = state.db.sub_task_counts(task.id)?;
        summaries.push(summarize(
            task,
            counts.processed(),
            counts.completed,
            counts.failed,
            counts.total.max(task.total_files),
        ));
    }

    Ok(Json(TaskListResponse {
        tasks: summaries,
        total,
        page,
        page_size,
    }))
}

/// GET /api/tasks/:id - full task status
async fn get_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> StrmgenResult<Json<TaskDetail>> {
    let user_id = super::user_id_from(&headers);
    let task = owned_task(&state, id, user_id)?;
    let counts = state.db.sub_task_counts(id)?;

    Ok(Json(TaskDetail {
        summary: summarize(
            &task,
            counts.processed(),
            counts.completed,
            counts.failed,
            counts.total.max(task.total_files),
        ),
        output_dir: task.output_dir.clone(),
        worker_count: task.worker_count,
        server_id: task.server_id,
        download_server_id: task.download_server_id,
        source_record_id: task.source_record_id,
        last_heartbeat: task.last_heartbeat,
        run_duration: task.run_duration,
        strm_completed: counts.strm_completed,
        strm_failed: counts.strm_failed,
        resource_completed: counts.resource_completed,
        resource_failed: counts.resource_failed,
        pending: counts.pending,
        downloading: counts.downloading,
        retry: counts.retry,
    }))
}

/// POST /api/tasks/:id/cancel
async fn cancel_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> StrmgenResult<Json<CancelOutcome>> {
    let user_id = super::user_id_from(&headers);
    let outcome = actions::cancel_task(&state.db, id, user_id)?;
    Ok(Json(outcome))
}

/// POST /api/tasks/:id/continue - resume a canceled task
async fn continue_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> StrmgenResult<Json<ContinueOutcome>> {
    let user_id = super::user_id_from(&headers);
    let outcome = actions::continue_task(&state.db, id, user_id)?;

    let processor = Arc::clone(&state.processor);
    tokio::spawn(async move {
        if let Err(e) = processor.run_task(id).await {
            tracing::error!("Continued task {} failed: {}", id, e);
        }
    });

    Ok(Json(outcome))
}

/// DELETE /api/tasks/:id
async fn delete_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> StrmgenResult<StatusCode> {
    let user_id = super::user_id_from(&headers);
    actions::delete_task(&state.db, id, user_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/tasks/recover - manual orphan-recovery trigger
async fn recover_tasks(
    State(state): State<Arc<AppState>>,
) -> StrmgenResult<Json<RecoveryReport>> {
    let report = recovery::recover_orphaned_tasks(&state.db)?;
    Ok(Json(report))
}

/// GET /api/tasks/:id/files - paginated sub-task listing
async fn list_task_files(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<ListFilesQuery>,
) -> StrmgenResult<Json<SubTaskListResponse>> {
    let user_id = super::user_id_from(&headers);
    owned_task(&state, id, user_id)?;

    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(10).clamp(1, 100);
    let file_type = query
        .file_type
        .as_deref()
        .filter(|t| *t != "all")
        .map(FileCategory::from_str);
    let status = query
        .status
        .as_deref()
        .map(|s| SubTaskStatus::from_str(&s.to_lowercase()));

    let (files, total) = state
        .db
        .list_sub_tasks_async(id, file_type, status, query.search.clone(), page, page_size)
        .await?;

    Ok(Json(SubTaskListResponse {
        files,
        total,
        page,
        page_size,
    }))
}

/// GET /api/tasks/:id/logs - merged log streams, filtered and paginated
async fn get_task_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<LogsQuery>,
) -> StrmgenResult<Json<TaskLogsResponse>> {
    let user_id = super::user_id_from(&headers);
    owned_task(&state, id, user_id)?;

    let log_type = query.log_type.as_deref();
    let level = query.level.as_deref();
    let search = query.search.as_deref();

    let mut entries: Vec<LogEntry> = Vec::new();

    if log_type.is_none() || log_type == Some("task") {
        let content = state.db.get_task_log(id)?;
        let wanted_level = level.map(|l| l.to_uppercase());
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let (timestamp, line_level, _) = parse_log_line(line);
            if let Some(wanted) = wanted_level.as_deref() {
                if line_level.as_deref() != Some(wanted) {
                    continue;
                }
            }
            if let Some(needle) = search {
                if !line.to_lowercase().contains(&needle.to_lowercase()) {
                    continue;
                }
            }
            entries.push(LogEntry {
                stream: "task",
                content: line.to_string(),
                timestamp,
                level: line_level,
                source_path: None,
                target_path: None,
                is_success: None,
                error_message: None,
            });
        }
    }

    if log_type.is_none() || log_type == Some("download") {
        for entry in state.db.download_logs_for_task(id, level, search)? {
            entries.push(LogEntry {
                stream: "download",
                content: format!(
                    "[{}] [{}] [download] {}",
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.log_level,
                    entry.log_message
                ),
                timestamp: Some(entry.created_at),
                level: Some(entry.log_level),
                source_path: Some(entry.file_path),
                target_path: entry.target_path,
                is_success: Some(entry.is_success),
                error_message: entry.error_message,
            });
        }
    }

    if log_type.is_none() || log_type == Some("strm") {
        for entry in state.db.strm_logs_for_task(id, level, search)? {
            entries.push(LogEntry {
                stream: "strm",
                content: format!(
                    "[{}] [{}] [strm] {}",
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.log_level,
                    entry.log_message
                ),
                timestamp: Some(entry.created_at),
                level: Some(entry.log_level),
                source_path: Some(entry.source_path),
                target_path: entry.target_path,
                is_success: Some(entry.is_success),
                error_message: entry.error_message,
            });
        }
    }

    // Undated lines sort to the front; timestamps are already naive local
    entries.sort_by_key(|entry| entry.timestamp.unwrap_or(NaiveDateTime::MIN));

    let raw_content = entries
        .iter()
        .map(|entry| entry.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(50).clamp(1, 500);
    let total = entries.len();
    let start = ((page - 1) * page_size) as usize;
    let logs: Vec<LogEntry> = entries
        .into_iter()
        .skip(start)
        .take(page_size as usize)
        .collect();

    Ok(Json(TaskLogsResponse {
        logs,
        total,
        page,
        page_size,
        raw_content,
    }))
}

/// GET /api/tasks/:id/directory - one level of the virtual tree
async fn get_directory_content(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<DirectoryQuery>,
) -> StrmgenResult<Json<preview::DirectoryListing>> {
    let user_id = super::user_id_from(&headers);
    owned_task(&state, id, user_id)?;
    Ok(Json(preview::directory_content(&state.db, id, &query.path)?))
}

/// GET /api/tasks/:id/preview - artifact preview by source path
async fn get_file_preview(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<PreviewQuery>,
) -> StrmgenResult<Json<preview::FilePreview>> {
    let user_id = super::user_id_from(&headers);
    owned_task(&state, id, user_id)?;
    Ok(Json(preview::file_preview(&state.db, id, &query.path)?))
}

fn owned_task(state: &AppState, task_id: i64, user_id: i64) -> StrmgenResult<Task> {
    let task = state
        .db
        .get_task(task_id)?
        .ok_or(StrmgenError::TaskNotFound(task_id))?;
    if task.created_by != user_id {
        return Err(StrmgenError::PermissionDenied(format!(
            "task {} belongs to another user",
            task_id
        )));
    }
    Ok(task)
}
