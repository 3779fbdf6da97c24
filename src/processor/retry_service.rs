//! Retry Service
//!
//! Process-wide singleton that promotes deferred retries back into work.
//! Every 10 seconds it collects `retry` sub-tasks whose backoff expired,
//! groups them by parent task and re-dispatches them through the processor's
//! handler classes. The processor's own runnable selection also picks up due
//! retries while a run is in flight; this service guarantees forward
//! progress when no run is otherwise scheduled.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::processor::model::{now_local, ProcessKind, SubTask, TaskStatus};
use crate::processor::runner::Processor;
use crate::processor::task_log::TaskLogBuffer;

const CHECK_INTERVAL: Duration = Duration::from_secs(10);
const ERROR_BACKOFF: Duration = Duration::from_secs(30);

pub struct RetryService {
    processor: Arc<Processor>,
    running: AtomicBool,
}

impl RetryService {
    pub fn new(processor: Arc<Processor>) -> Arc<Self> {
        Arc::new(Self {
            processor,
            running: AtomicBool::new(false),
        })
    }

    /// Start the background loop. Double starts are ignored.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::info!("Retry service already running");
            return;
        }
        tracing::info!("Starting retry service");

        let service = Arc::clone(self);
        tokio::spawn(async move {
            while service.running.load(Ordering::SeqCst) {
                match service.process_due_retries().await {
                    Ok(()) => tokio::time::sleep(CHECK_INTERVAL).await,
                    Err(e) => {
                        tracing::error!("Retry service iteration failed: {}", e);
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                }
            }
            tracing::info!("Retry service stopped");
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn process_due_retries(&self) -> anyhow::Result<()> {
        let db = Arc::clone(self.processor.db());
        let due = db.due_retry_sub_tasks(now_local())?;
        if due.is_empty() {
            return Ok(());
        }

        tracing::info!("Retry service found {} due retry sub-tasks", due.len());

        let mut by_task: BTreeMap<i64, Vec<SubTask>> = BTreeMap::new();
        for sub in due {
            by_task.entry(sub.task_id).or_default().push(sub);
        }

        for (task_id, subs) in by_task {
            if let Err(e) = self.process_task_group(task_id, subs).await {
                tracing::error!("Retry dispatch for task {} failed: {}", task_id, e);
            }
        }
        Ok(())
    }

    async fn process_task_group(&self, task_id: i64, subs: Vec<SubTask>) -> anyhow::Result<()> {
        let db = Arc::clone(self.processor.db());

        let task = match db.get_task(task_id)? {
            Some(task) => task,
            None => {
                tracing::warn!("Retry group for unknown task {}, skipping", task_id);
                return Ok(());
            }
        };
        if matches!(
            task.status,
            TaskStatus::Canceled | TaskStatus::Completed | TaskStatus::Failed
        ) {
            tracing::info!(
                "Task {} is {}, skipping its retries",
                task_id,
                task.status.as_str()
            );
            return Ok(());
        }

        let settings = db.get_settings()?;
        let log = TaskLogBuffer::new(task_id);

        let (strm, download): (Vec<_>, Vec<_>) = subs
            .into_iter()
            .partition(|s| s.process_kind == ProcessKind::StrmGeneration);

        if !strm.is_empty() {
            log.info(&format!(
                "[retry service] re-running {} STRM generation retries",
                strm.len()
            ));
            self.processor
                .dispatch_group(&task, ProcessKind::StrmGeneration, strm, &log, &settings)
                .await?;
        }
        if !download.is_empty() {
            log.info(&format!(
                "[retry service] re-running {} resource download retries",
                download.len()
            ));
            self.processor
                .dispatch_group(&task, ProcessKind::ResourceDownload, download, &log, &settings)
                .await?;
        }

        db.touch_task_heartbeat(task_id, now_local())?;
        log.flush(&db);

        // Settle the parent once nothing non-terminal remains
        let counts = db.sub_task_counts(task_id)?;
        if counts.open() == 0 {
            self.processor.reconcile(task_id, &log)?;
        }
        Ok(())
    }
}
