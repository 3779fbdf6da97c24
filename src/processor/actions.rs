//! Task Lifecycle Actions
//!
//! Create / start / cancel / continue / delete. Cancellation is cooperative:
//! the status flip here is what the processor's batch loop and the handlers
//! observe at their next check.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::db::Db;
use crate::error::{StrmgenError, StrmgenResult};
use crate::processor::model::{
    now_local, ProcessKind, SubTask, SubTaskStatus, Task, TaskStatus,
};
use crate::processor::runner::Processor;
use crate::processor::task_log::TaskLogBuffer;
use crate::settings::output_base;
use crate::uploads;

pub struct CreateTaskParams {
    pub record_id: i64,
    pub server_id: i64,
    pub download_server_id: Option<i64>,
    pub output_dir: Option<String>,
    pub name: Option<String>,
    pub worker_count: Option<u32>,
    pub created_by: i64,
}

/// Create a task in `pending`. The output directory is only named here;
/// it is created lazily when the task starts.
pub fn create_task(db: &Db, fallback_output_base: &Path, params: CreateTaskParams) -> StrmgenResult<Task> {
    db.get_server(params.server_id)?
        .ok_or(StrmgenError::ServerNotFound(params.server_id))?;
    if let Some(id) = params.download_server_id {
        db.get_server(id)?.ok_or(StrmgenError::ServerNotFound(id))?;
    }
    db.get_upload(params.record_id)?
        .ok_or(StrmgenError::UploadNotFound(params.record_id))?;

    let settings = db.get_settings()?;
    let now = now_local();

    let output_dir = match params.output_dir {
        Some(dir) if !dir.trim().is_empty() => dir,
        _ => {
            let base = output_base(&settings, fallback_output_base);
            let task_dir = format!(
                "task_{}_{}",
                now.format("%Y%m%d_%H%M%S"),
                params.created_by
            );
            base.join(task_dir).to_string_lossy().to_string()
        }
    };

    let name = params.name.unwrap_or_else(|| {
        format!(
            "STRM task - record {} - {}",
            params.record_id,
            now.format("%Y-%m-%d %H:%M:%S")
        )
    });

    let mut task = Task {
        id: 0,
        name,
        status: TaskStatus::Pending,
        server_id: params.server_id,
        download_server_id: params.download_server_id,
        source_record_id: params.record_id,
        output_dir,
        total_files: 0,
        processed_files: 0,
        success_files: 0,
        failed_files: 0,
        start_time: None,
        end_time: None,
        worker_count: params.worker_count.unwrap_or(settings.download_workers).max(1),
        log_content: String::new(),
        last_heartbeat: None,
        run_duration: None,
        created_by: params.created_by,
        created_at: now,
    };
    task.id = db.insert_task(&task)?;
    Ok(task)
}

fn get_owned_task(db: &Db, task_id: i64, user_id: i64) -> StrmgenResult<Task> {
    let task = db
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

/// Expand a pending task into sub-tasks from the cached parse result and run
/// the processor over them.
///
/// Sub-tasks are generated exactly once, atomically with the transition to
/// `running`. A parse result with no materialisable files completes the task
/// immediately.
pub async fn start_task(processor: &Processor, task_id: i64, user_id: i64) -> StrmgenResult<()> {
    let db = Arc::clone(processor.db());
    let mut task = get_owned_task(&db, task_id, user_id)?;

    if task.status != TaskStatus::Pending {
        return Err(StrmgenError::PreconditionFailed {
            id: task_id,
            expected: "pending".to_string(),
            actual: task.status.as_str().to_string(),
        });
    }

    let result = match uploads::load_parse_result(&db, task.source_record_id) {
        Ok(result) => result,
        Err(e) => {
            task.status = TaskStatus::Failed;
            db.save_task(&task)?;
            let log = TaskLogBuffer::new(task_id);
            log.error(&format!("Cannot load the parse result: {}", e));
            log.flush(&db);
            return Err(e);
        }
    };
    let settings = db.get_settings()?;
    let now = now_local();

    let sub_tasks: Vec<SubTask> = result
        .parsed_files
        .iter()
        .filter(|entry| !entry.is_directory)
        .filter_map(|entry| {
            let process_kind = ProcessKind::for_category(entry.file_type)?;
            Some(SubTask {
                id: 0,
                task_id,
                source_path: entry.path.clone(),
                target_path: None,
                file_type: entry.file_type,
                process_kind,
                status: SubTaskStatus::Pending,
                priority: 0,
                attempts: 0,
                max_attempts: settings.failure_retry_count.max(1),
                file_size: None,
                download_started: None,
                download_completed: None,
                duration: None,
                speed: None,
                worker_id: None,
                error_message: None,
                retry_after: None,
                updated_at: now,
            })
        })
        .collect();

    if sub_tasks.is_empty() {
        task.status = TaskStatus::Completed;
        task.start_time = Some(now);
        task.end_time = Some(now);
        db.save_task(&task)?;
        let log = TaskLogBuffer::new(task_id);
        log.info("No materialisable files in the parse result, task completed");
        log.flush(&db);
        return Ok(());
    }

    task.status = TaskStatus::Running;
    task.total_files = sub_tasks.len() as i64;
    task.start_time = Some(now);
    db.insert_sub_tasks(&task, &sub_tasks)?;

    let log = TaskLogBuffer::new(task_id);
    log.info(&format!(
        "Task started: {} files ({} videos as STRM, {} assets to download)",
        result.stats.total,
        result.stats.video,
        result.stats.audio + result.stats.image + result.stats.subtitle + result.stats.metadata
    ));
    log.flush(&db);

    processor.run_task(task_id).await
}

#[derive(Debug, Serialize)]
pub struct CancelOutcome {
    pub task_id: i64,
    pub canceled_sub_tasks: usize,
}

/// Cancel a pending or running task and bulk-cancel its open sub-tasks.
/// Cancelling a task twice fails the precondition gate on the second call.
pub fn cancel_task(db: &Db, task_id: i64, user_id: i64) -> StrmgenResult<CancelOutcome> {
    let mut task = get_owned_task(db, task_id, user_id)?;

    if !task.status.can_cancel() {
        return Err(StrmgenError::PreconditionFailed {
            id: task_id,
            expected: "pending or running".to_string(),
            actual: task.status.as_str().to_string(),
        });
    }

    let now = now_local();
    task.status = TaskStatus::Canceled;
    task.end_time = Some(now);
    db.save_task(&task)?;

    let log = TaskLogBuffer::new(task_id);
    log.info("Task canceled by user");
    log.flush(db);

    let canceled = db.cancel_open_sub_tasks(task_id, "task canceled by user", now)?;
    tracing::info!("Task {} canceled, {} sub-tasks canceled with it", task_id, canceled);

    Ok(CancelOutcome {
        task_id,
        canceled_sub_tasks: canceled,
    })
}

#[derive(Debug, Serialize)]
pub struct ContinueOutcome {
    pub task_id: i64,
    /// completed sub-tasks whose artifact is still on disk
    pub kept: usize,
    /// canceled sub-tasks promoted to completed because the artifact survived
    pub promoted: usize,
    /// sub-tasks returned to pending for reprocessing
    pub reset: usize,
}

/// Continue a canceled task: keep surviving artifacts, promote canceled
/// sub-tasks whose artifact passes the integrity check, reset the rest to
/// pending. Existing sub-tasks are never recreated.
///
/// The processor is not invoked here; run it over the task afterwards.
pub fn continue_task(db: &Db, task_id: i64, user_id: i64) -> StrmgenResult<ContinueOutcome> {
    let mut task = get_owned_task(db, task_id, user_id)?;

    if !task.status.can_continue() {
        return Err(StrmgenError::PreconditionFailed {
            id: task_id,
            expected: "canceled".to_string(),
            actual: task.status.as_str().to_string(),
        });
    }

    let now = now_local();
    task.status = TaskStatus::Running;
    task.start_time = Some(now);
    task.end_time = None;
    task.last_heartbeat = Some(now);
    db.save_task(&task)?;

    let log = TaskLogBuffer::new(task_id);
    log.info(&format!("Task continued by user {}", user_id));

    let mut outcome = ContinueOutcome {
        task_id,
        kept: 0,
        promoted: 0,
        reset: 0,
    };

    for mut sub in db.sub_tasks_for_task(task_id)? {
        match sub.status {
            SubTaskStatus::Completed => {
                if target_exists(&sub) {
                    outcome.kept += 1;
                    continue;
                }
                sub.status = SubTaskStatus::Pending;
                sub.error_message = None;
                outcome.reset += 1;
            }
            SubTaskStatus::Canceled => {
                if target_is_intact(&sub) {
                    sub.status = SubTaskStatus::Completed;
                    sub.error_message = None;
                    outcome.promoted += 1;
                } else {
                    sub.status = SubTaskStatus::Pending;
                    sub.error_message = None;
                    outcome.reset += 1;
                }
            }
            SubTaskStatus::Failed | SubTaskStatus::Retry => {
                sub.status = SubTaskStatus::Pending;
                sub.error_message = None;
                sub.attempts = 0;
                sub.retry_after = None;
                outcome.reset += 1;
            }
            SubTaskStatus::Pending | SubTaskStatus::Downloading => continue,
        }
        sub.updated_at = now;
        db.save_sub_task(&sub)?;
    }

    if outcome.kept > 0 {
        log.info(&format!("Kept {} completed files", outcome.kept));
    }
    if outcome.promoted > 0 {
        log.info(&format!("Promoted {} surviving files to completed", outcome.promoted));
    }
    if outcome.reset > 0 {
        log.info(&format!("Reset {} files for reprocessing", outcome.reset));
    }
    log.flush(db);

    tracing::info!(
        "Task {} continued: {} kept, {} promoted, {} reset",
        task_id,
        outcome.kept,
        outcome.promoted,
        outcome.reset
    );
    Ok(outcome)
}

fn target_exists(sub: &SubTask) -> bool {
    sub.target_path
        .as_deref()
        .map(|p| Path::new(p).exists())
        .unwrap_or(false)
}

/// Integrity check for artifacts of canceled sub-tasks: downloads must match
/// the recorded byte size, STRM stubs must be non-empty.
fn target_is_intact(sub: &SubTask) -> bool {
    let path = match sub.target_path.as_deref() {
        Some(p) => Path::new(p),
        None => return false,
    };
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return false,
    };

    match sub.process_kind {
        ProcessKind::ResourceDownload => match sub.file_size {
            Some(expected) => metadata.len() as i64 == expected,
            None => true,
        },
        ProcessKind::StrmGeneration => metadata.len() > 0,
        ProcessKind::PendingWait => false,
    }
}

/// Delete a task, its sub-tasks, both artifact-log streams and the output
/// subtree.
pub fn delete_task(db: &Db, task_id: i64, user_id: i64) -> StrmgenResult<()> {
    let task = get_owned_task(db, task_id, user_id)?;

    let output_dir = Path::new(&task.output_dir);
    if output_dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(output_dir) {
            tracing::error!(
                "Failed to remove output directory {} of task {}: {}",
                task.output_dir,
                task_id,
                e
            );
        }
    }

    db.delete_task_cascade(task_id)?;
    tracing::info!("Task {} deleted", task_id);
    Ok(())
}
