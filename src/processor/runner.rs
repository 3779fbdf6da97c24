//! Worker Pool / Processor
//!
//! Drives one task at a time per invocation: expands runnable sub-tasks into
//! sequential batches of `worker_count`, runs each batch concurrently,
//! enforces the retry policy, accounts progress and heartbeats, and
//! reconciles the parent's terminal state.

use futures_util::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;

use crate::db::{Db, MediaServer};
use crate::error::{StrmgenError, StrmgenResult};
use crate::processor::engine::{
    create_download_client, HandlerError, ResourceDownloader, StrmWriter, SubTaskHandler,
};
use crate::processor::model::{now_local, ProcessKind, SubTask, SubTaskStatus, Task, TaskStatus};
use crate::processor::progress::progress_line;
use crate::processor::task_log::TaskLogBuffer;
use crate::settings::Settings;

pub struct Processor {
    db: Arc<Db>,
    http: reqwest::Client,
}

impl Processor {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            http: create_download_client(),
        }
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    /// Resolve the media and download servers a task was created with.
    /// The media server doubles as download server when none is set.
    pub fn resolve_servers(&self, task: &Task) -> StrmgenResult<(MediaServer, MediaServer)> {
        let media = self
            .db
            .get_server(task.server_id)?
            .ok_or(StrmgenError::ServerNotFound(task.server_id))?;

        let download = match task.download_server_id {
            Some(id) => self
                .db
                .get_server(id)?
                .ok_or(StrmgenError::ServerNotFound(id))?,
            None => media.clone(),
        };
        Ok((media, download))
    }

    /// Run both handler phases of a task, then reconcile its terminal state.
    ///
    /// Any unexpected error marks the task failed; handler errors never
    /// escape a batch.
    pub async fn run_task(&self, task_id: i64) -> StrmgenResult<()> {
        let result = self.run_task_inner(task_id).await;

        if let Err(e) = &result {
            tracing::error!("Task {} processing failed: {}", task_id, e);
            if let Ok(Some(mut task)) = self.db.get_task(task_id) {
                let log = TaskLogBuffer::new(task_id);
                log.error(&format!("Task processing failed: {}", e));
                log.flush(&self.db);
                task.status = TaskStatus::Failed;
                task.end_time = Some(now_local());
                let _ = self.db.save_task(&task);
            }
        }
        result
    }

    async fn run_task_inner(&self, task_id: i64) -> StrmgenResult<()> {
        let task = self
            .db
            .get_task(task_id)?
            .ok_or(StrmgenError::TaskNotFound(task_id))?;
        if task.status == TaskStatus::Canceled {
            tracing::info!("Task {} is canceled, skipping processing", task_id);
            return Ok(());
        }

        let settings = self.db.get_settings()?;
        let (media_server, download_server) = self.resolve_servers(&task)?;

        // Output directory is created lazily at start, never at creation
        std::fs::create_dir_all(&task.output_dir)?;

        let log = TaskLogBuffer::new(task_id);
        self.log_run_banner(&task, &settings, &log);
        log.flush(&self.db);
        self.db.touch_task_heartbeat(task_id, now_local())?;

        // Phase 1: STRM generation
        let strm_subs = self
            .db
            .runnable_sub_tasks(task_id, ProcessKind::StrmGeneration, now_local())?;
        if !strm_subs.is_empty() {
            log.info(&format!(
                "Processing {} STRM generation sub-tasks",
                strm_subs.len()
            ));
            let writer = StrmWriter::new(
                Arc::clone(&self.db),
                task_id,
                media_server.clone(),
                PathBuf::from(&task.output_dir),
                settings.enable_path_replacement,
                settings.replacement_path.clone(),
            );
            self.drive_sub_tasks(&task, &writer, strm_subs, &log, &settings)
                .await?;
        } else {
            log.info("No STRM generation sub-tasks ready to run");
        }

        if self.parent_canceled(task_id)? {
            return self.finish_canceled(task_id, &log);
        }
        self.db.touch_task_heartbeat(task_id, now_local())?;

        // Phase 2: resource downloads
        let download_subs = self
            .db
            .runnable_sub_tasks(task_id, ProcessKind::ResourceDownload, now_local())?;
        if !download_subs.is_empty() {
            log.info(&format!(
                "Processing {} resource download sub-tasks",
                download_subs.len()
            ));
            let downloader = ResourceDownloader::new(
                Arc::clone(&self.db),
                task_id,
                download_server,
                PathBuf::from(&task.output_dir),
                self.http.clone(),
            );
            self.drive_sub_tasks(&task, &downloader, download_subs, &log, &settings)
                .await?;
        } else {
            log.info("No resource download sub-tasks ready to run");
        }

        self.reconcile(task_id, &log)
    }

    fn log_run_banner(&self, task: &Task, settings: &Settings, log: &TaskLogBuffer) {
        log.info("Processor configuration:");
        log.info(&format!("  files total: {}", task.total_files));
        log.info(&format!("  workers: {}", task.worker_count));
        log.info(&format!(
            "  path rewrite: {}",
            if settings.enable_path_replacement {
                format!("enabled ({})", settings.replacement_path)
            } else {
                "disabled".to_string()
            }
        ));
        log.info(&format!(
            "  retry policy: {} attempts, {}s interval",
            settings.failure_retry_count, settings.retry_interval_seconds
        ));
    }

    fn parent_canceled(&self, task_id: i64) -> StrmgenResult<bool> {
        let task = self
            .db
            .get_task(task_id)?
            .ok_or(StrmgenError::TaskNotFound(task_id))?;
        Ok(task.status == TaskStatus::Canceled)
    }

    /// Dispatch an explicit sub-task group to the handler class matching its
    /// process kind. The retry service re-arms deferred retries through this.
    pub async fn dispatch_group(
        &self,
        task: &Task,
        kind: ProcessKind,
        subs: Vec<SubTask>,
        log: &TaskLogBuffer,
        settings: &Settings,
    ) -> StrmgenResult<()> {
        if subs.is_empty() {
            return Ok(());
        }
        let (media_server, download_server) = self.resolve_servers(task)?;

        match kind {
            ProcessKind::StrmGeneration => {
                let writer = StrmWriter::new(
                    Arc::clone(&self.db),
                    task.id,
                    media_server,
                    PathBuf::from(&task.output_dir),
                    settings.enable_path_replacement,
                    settings.replacement_path.clone(),
                );
                self.drive_sub_tasks(task, &writer, subs, log, settings).await
            }
            ProcessKind::ResourceDownload => {
                let downloader = ResourceDownloader::new(
                    Arc::clone(&self.db),
                    task.id,
                    download_server,
                    PathBuf::from(&task.output_dir),
                    self.http.clone(),
                );
                self.drive_sub_tasks(task, &downloader, subs, log, settings).await
            }
            // Reserved kind: nothing schedules it
            ProcessKind::PendingWait => Ok(()),
        }
    }

    /// Run one handler over an explicit sub-task list in sequential batches.
    pub async fn drive_sub_tasks(
        &self,
        task: &Task,
        handler: &dyn SubTaskHandler,
        subs: Vec<SubTask>,
        log: &TaskLogBuffer,
        settings: &Settings,
    ) -> StrmgenResult<()> {
        let workers = task.worker_count.max(1) as usize;

        for (batch_index, batch) in subs.chunks(workers).enumerate() {
            // Cooperative cancellation: the parent is re-read before every batch
            if self.parent_canceled(task.id)? {
                tracing::info!("Task {} canceled, stopping {}", task.id, handler.label());
                log.flush(&self.db);
                return Ok(());
            }

            let futures = batch.iter().enumerate().map(|(idx, sub)| {
                self.process_single(sub.id, handler, log, settings, (idx % workers) + 1)
            });
            join_all(futures).await;

            if self.parent_canceled(task.id)? {
                log.flush(&self.db);
                return Ok(());
            }

            self.db.touch_task_heartbeat(task.id, now_local())?;

            let counts = self.db.sub_task_counts(task.id)?;
            log.info(&progress_line(
                counts.processed(),
                counts.total,
                &format!("{} (batch {})", handler.label(), batch_index + 1),
            ));
            log.flush(&self.db);
        }

        Ok(())
    }

    /// Process one sub-task end to end. Handler errors are consumed here and
    /// drive the retry transition; they never cross the batch boundary.
    async fn process_single(
        &self,
        sub_id: i64,
        handler: &dyn SubTaskHandler,
        log: &TaskLogBuffer,
        settings: &Settings,
        worker: usize,
    ) -> bool {
        // Fresh state: the row may have been canceled or completed elsewhere
        let mut sub = match self.db.get_sub_task(sub_id) {
            Ok(Some(sub)) => sub,
            _ => return false,
        };
        if sub.status.is_terminal() {
            return sub.status == SubTaskStatus::Completed;
        }
        // Another dispatcher (initial run vs. retry service) already owns it
        if sub.status == SubTaskStatus::Downloading {
            return false;
        }

        // The parent may have been canceled while this unit sat in its batch
        match self.db.get_task(sub.task_id) {
            Ok(Some(parent)) if parent.status == TaskStatus::Canceled => {
                sub.status = SubTaskStatus::Canceled;
                sub.error_message = Some("parent task canceled".to_string());
                sub.updated_at = now_local();
                let _ = self.db.save_sub_task(&sub);
                return false;
            }
            Ok(Some(_)) => {}
            _ => return false,
        }

        if sub.status == SubTaskStatus::Retry {
            log.info(&format!(
                "[worker {}] Retrying {}: {} (attempt {}/{})",
                worker,
                handler.label(),
                sub.file_name(),
                sub.attempts + 1,
                sub.max_attempts
            ));
            sub.retry_after = None;
            sub.error_message = None;
        }

        sub.status = SubTaskStatus::Downloading;
        sub.worker_id = Some(format!("worker-{}-{}", worker, uuid::Uuid::new_v4()));
        sub.download_started = Some(now_local());
        sub.updated_at = now_local();
        if let Err(e) = self.db.save_sub_task(&sub) {
            tracing::error!("Failed to claim sub-task {}: {}", sub.id, e);
            return false;
        }

        match handler.execute(&sub, worker).await {
            Ok(outcome) => {
                sub.status = SubTaskStatus::Completed;
                sub.target_path = Some(outcome.target_path.to_string_lossy().to_string());
                if let Some(size) = outcome.file_size {
                    sub.file_size = Some(size as i64);
                }
                sub.duration = Some(outcome.duration);
                sub.speed = outcome.speed;
                sub.download_completed = Some(now_local());
                sub.error_message = None;
                sub.updated_at = now_local();
                if let Err(e) = self.db.save_sub_task(&sub) {
                    tracing::error!("Failed to persist sub-task {} completion: {}", sub.id, e);
                }
                true
            }
            Err(e) => {
                self.apply_retry_policy(&mut sub, e, handler, log, settings, worker);
                false
            }
        }
    }

    /// attempts+1, clear the worker claim, then either re-arm as `retry`
    /// with the configured backoff or fail permanently.
    fn apply_retry_policy(
        &self,
        sub: &mut SubTask,
        error: HandlerError,
        handler: &dyn SubTaskHandler,
        log: &TaskLogBuffer,
        settings: &Settings,
        worker: usize,
    ) {
        sub.attempts += 1;
        sub.error_message = Some(error.to_string());
        sub.worker_id = None;
        sub.download_started = None;
        sub.download_completed = None;

        if sub.attempts < sub.max_attempts {
            sub.status = SubTaskStatus::Retry;
            sub.retry_after =
                Some(now_local() + chrono::Duration::seconds(settings.retry_interval_seconds as i64));
            log.warning(&format!(
                "[worker {}] {} failed, retrying in {}s: {} (attempt {}/{})",
                worker,
                handler.label(),
                settings.retry_interval_seconds,
                sub.file_name(),
                sub.attempts,
                sub.max_attempts
            ));
        } else {
            sub.status = SubTaskStatus::Failed;
            log.error(&format!(
                "[worker {}] {} finally failed: {} (max attempts {} reached)",
                worker,
                handler.label(),
                sub.file_name(),
                sub.max_attempts
            ));
        }

        sub.updated_at = now_local();
        if let Err(e) = self.db.save_sub_task(sub) {
            tracing::error!("Failed to persist sub-task {} retry state: {}", sub.id, e);
        }
    }

    fn finish_canceled(&self, task_id: i64, log: &TaskLogBuffer) -> StrmgenResult<()> {
        let mut task = self
            .db
            .get_task(task_id)?
            .ok_or(StrmgenError::TaskNotFound(task_id))?;
        let now = now_local();
        if task.end_time.is_none() {
            task.end_time = Some(now);
        }
        task.run_duration = task
            .start_time
            .map(|start| (now - start).num_milliseconds() as f64 / 1000.0);
        log.info("Task canceled, processing stopped");
        log.flush(&self.db);
        self.db.save_task(&task)?;
        Ok(())
    }

    /// Recompute the parent's counters from sub-task state and settle its
    /// terminal status. When retries are still outstanding the task stays
    /// running; the retry service re-reconciles once they drain.
    pub fn reconcile(&self, task_id: i64, log: &TaskLogBuffer) -> StrmgenResult<()> {
        let mut task = self
            .db
            .get_task(task_id)?
            .ok_or(StrmgenError::TaskNotFound(task_id))?;

        if task.status == TaskStatus::Canceled {
            return self.finish_canceled(task_id, log);
        }

        let counts = self.db.sub_task_counts(task_id)?;
        let now = now_local();
        let elapsed = task
            .start_time
            .map(|start| (now - start).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);

        task.processed_files = counts.processed();
        task.success_files = counts.completed;
        task.failed_files = counts.failed;

        let settled = counts.open() == 0;
        if settled {
            task.end_time = Some(now);
            task.run_duration = Some(elapsed);
            if counts.failed > 0 {
                task.status = TaskStatus::Failed;
                let strm = counts.strm_failed;
                let resource = counts.resource_failed;
                let reason = if strm > 0 && resource > 0 {
                    format!(
                        "Task failed: {} STRM files and {} resource files failed",
                        strm, resource
                    )
                } else if strm > 0 {
                    format!("Task failed: {} STRM files failed", strm)
                } else {
                    format!("Task failed: {} resource files failed", resource)
                };
                log.error(&reason);
            } else {
                task.status = TaskStatus::Completed;
                log.info("Task completed: all files processed successfully");
            }
        } else {
            log.info(&format!(
                "{} sub-tasks awaiting retry, task stays running",
                counts.retry + counts.pending + counts.downloading
            ));
        }

        log.info(&progress_line(counts.processed(), counts.total, "finished"));
        if settled {
            log.info(&format!("Elapsed: {:.2}s", elapsed));
            log.info(&format!(
                "Files: total {}, success {}, failed {}",
                counts.total, counts.completed, counts.failed
            ));
            if counts.strm_completed + counts.strm_failed > 0 {
                log.info(&format!(
                    "STRM files: {} succeeded, {} failed",
                    counts.strm_completed, counts.strm_failed
                ));
            }
            if counts.resource_completed + counts.resource_failed > 0 {
                log.info(&format!(
                    "Resource files: {} succeeded, {} failed",
                    counts.resource_completed, counts.resource_failed
                ));
            }
        }
        log.flush(&self.db);
        self.db.save_task(&task)?;
        Ok(())
    }
}
