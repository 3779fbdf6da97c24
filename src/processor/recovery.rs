//! Orphan-Task Recovery
//!
//! Heals tasks stranded in `running` by a crash or restart. Runs once at
//! startup and periodically thereafter. Three criteria, checked in order:
//! total runtime timeout, heartbeat timeout, and a no-recent-activity check
//! for tasks old enough to have produced some. All datetime comparisons use
//! naive local values only.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::db::Db;
use crate::error::StrmgenResult;
use crate::processor::model::{now_local, SubTaskStatus, Task, TaskStatus};
use crate::processor::task_log::TaskLogBuffer;

/// Re-read the disable flag at this cadence while periodic checks are off
const DISABLED_RECHECK: Duration = Duration::from_secs(300);
const ERROR_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryDetail {
    pub task_id: i64,
    pub task_name: String,
    /// "timeout" | "recovered" | "checked"
    pub action: &'static str,
    pub reason: String,
}

#[derive(Debug, Default, Serialize)]
pub struct RecoveryReport {
    pub checked_tasks: usize,
    pub recovered_tasks: usize,
    pub timeout_tasks: usize,
    pub promoted_sub_tasks: usize,
    pub details: Vec<RecoveryDetail>,
}

pub struct RecoveryService {
    db: Arc<Db>,
    running: AtomicBool,
}

impl RecoveryService {
    pub fn new(db: Arc<Db>) -> Arc<Self> {
        Arc::new(Self {
            db,
            running: AtomicBool::new(false),
        })
    }

    /// Run the startup pass and start the periodic loop.
    /// Double starts are ignored.
    pub async fn start(self: &Arc<Self>) -> StrmgenResult<RecoveryReport> {
        let report = recover_orphaned_tasks(&self.db)?;

        if self.running.swap(true, Ordering::SeqCst) {
            tracing::info!("Recovery service already running");
            return Ok(report);
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if !service.running.load(Ordering::SeqCst) {
                    break;
                }
                let settings = match service.db.get_settings() {
                    Ok(settings) => settings,
                    Err(e) => {
                        tracing::error!("Recovery service cannot read settings: {}", e);
                        tokio::time::sleep(ERROR_BACKOFF).await;
                        continue;
                    }
                };

                if !settings.enable_recovery_periodic_check {
                    tokio::time::sleep(DISABLED_RECHECK).await;
                    continue;
                }

                tokio::time::sleep(Duration::from_secs(settings.recovery_check_interval.max(1)))
                    .await;
                tracing::info!("Periodic orphan-task recovery check");
                if let Err(e) = recover_orphaned_tasks(&service.db) {
                    tracing::error!("Periodic recovery check failed: {}", e);
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
            tracing::info!("Recovery service stopped");
        });

        Ok(report)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// One full recovery pass. Running it again immediately makes no further
/// changes.
pub fn recover_orphaned_tasks(db: &Arc<Db>) -> StrmgenResult<RecoveryReport> {
    tracing::info!("Checking for orphaned tasks");
    let mut report = RecoveryReport::default();

    let running = db.running_tasks()?;
    report.checked_tasks = running.len();
    if running.is_empty() {
        tracing::info!("No running tasks found");
    }

    for task in running {
        match recover_single_task(db, &task) {
            Ok(detail) => {
                match detail.action {
                    "timeout" => report.timeout_tasks += 1,
                    "recovered" => report.recovered_tasks += 1,
                    _ => {}
                }
                report.details.push(detail);
            }
            Err(e) => {
                tracing::error!("Recovering task {} failed: {}", task.id, e);
            }
        }
    }

    report.promoted_sub_tasks = promote_stranded_sub_tasks(db)?;

    tracing::info!(
        "Recovery pass done: {} checked, {} recovered, {} timed out, {} sub-tasks promoted",
        report.checked_tasks,
        report.recovered_tasks,
        report.timeout_tasks,
        report.promoted_sub_tasks
    );
    Ok(report)
}

fn fail_orphaned_task(db: &Arc<Db>, task: &Task, reason: &str) -> StrmgenResult<()> {
    let now = now_local();
    let mut task = task.clone();
    task.status = TaskStatus::Failed;
    task.end_time = Some(now);
    db.save_task(&task)?;

    let log = TaskLogBuffer::new(task.id);
    log.error(reason);
    log.flush(db);

    let failed = db.fail_open_sub_tasks(task.id, reason, now)?;
    if failed > 0 {
        tracing::info!(
            "Marked {} open sub-tasks of task {} as failed",
            failed,
            task.id
        );
    }
    Ok(())
}

fn recover_single_task(db: &Arc<Db>, task: &Task) -> StrmgenResult<RecoveryDetail> {
    let settings = db.get_settings()?;
    let now = now_local();

    // 1. Total runtime timeout
    if let Some(start) = task.start_time {
        let elapsed = now - start;
        if elapsed > chrono::Duration::hours(settings.task_timeout_hours) {
            let reason = format!(
                "Task marked failed after exceeding the {}h runtime limit (ran {}m)",
                settings.task_timeout_hours,
                elapsed.num_minutes()
            );
            fail_orphaned_task(db, task, &reason)?;
            tracing::warn!("Task {} ({}) timed out", task.id, task.name);
            return Ok(RecoveryDetail {
                task_id: task.id,
                task_name: task.name.clone(),
                action: "timeout",
                reason,
            });
        }
    }

    // 2. Heartbeat timeout
    if let Some(heartbeat) = task.last_heartbeat {
        if now - heartbeat > chrono::Duration::minutes(settings.heartbeat_timeout_minutes) {
            let reason = format!(
                "Task marked failed after {}m without a heartbeat",
                settings.heartbeat_timeout_minutes
            );
            fail_orphaned_task(db, task, &reason)?;
            tracing::warn!("Task {} ({}) lost its heartbeat", task.id, task.name);
            return Ok(RecoveryDetail {
                task_id: task.id,
                task_name: task.name.clone(),
                action: "recovered",
                reason,
            });
        }
    }

    // 3. Old enough to have produced activity, but none recently
    if let Some(start) = task.start_time {
        if now - start > chrono::Duration::minutes(settings.activity_check_minutes) {
            let window_start =
                now - chrono::Duration::minutes(settings.recent_activity_minutes);
            let recent = db.sub_tasks_updated_since(task.id, window_start)?;
            if recent == 0 {
                let reason =
                    "Task marked failed: no sub-task activity after restart".to_string();
                fail_orphaned_task(db, task, &reason)?;
                tracing::warn!("Task {} ({}) shows no activity", task.id, task.name);
                return Ok(RecoveryDetail {
                    task_id: task.id,
                    task_name: task.name.clone(),
                    action: "recovered",
                    reason,
                });
            }
        }
    }

    Ok(RecoveryDetail {
        task_id: task.id,
        task_name: task.name.clone(),
        action: "checked",
        reason: "task looks healthy".to_string(),
    })
}

/// Promote `downloading` sub-tasks whose parent has already reached a
/// terminal state: canceled parents cancel them, otherwise they fail.
fn promote_stranded_sub_tasks(db: &Arc<Db>) -> StrmgenResult<usize> {
    let mut promoted = 0;
    for mut sub in db.downloading_sub_tasks()? {
        let parent = match db.get_task(sub.task_id)? {
            Some(parent) => parent,
            None => continue,
        };
        if !parent.status.is_terminal() {
            continue;
        }
        sub.status = if parent.status == TaskStatus::Canceled {
            SubTaskStatus::Canceled
        } else {
            SubTaskStatus::Failed
        };
        sub.error_message = Some(format!("parent task is {}", parent.status.as_str()));
        sub.updated_at = now_local();
        db.save_sub_task(&sub)?;
        promoted += 1;
    }
    Ok(promoted)
}
