//! Buffered Task Log
//!
//! The parent task carries an append-only text log. Handlers append lines
//! into an in-memory buffer; the runner flushes the buffer to the row once
//! per batch so long runs do not rewrite the row per line.

use std::sync::{Arc, Mutex};

use crate::db::Db;
use crate::processor::model::now_local;

/// Shared buffering writer for one task's log column
#[derive(Clone)]
pub struct TaskLogBuffer {
    task_id: i64,
    lines: Arc<Mutex<Vec<String>>>,
}

impl TaskLogBuffer {
    pub fn new(task_id: i64) -> Self {
        Self {
            task_id,
            lines: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    /// Append a formatted log line at the given level
    pub fn log(&self, message: &str, level: &str) {
        let timestamp = now_local().format("%Y-%m-%dT%H:%M:%S%.3f");
        let line = format!("[{}] [{}] {}", timestamp, level, message);
        self.lines.lock().unwrap().push(line);
    }

    pub fn info(&self, message: &str) {
        self.log(message, "INFO");
    }

    pub fn warning(&self, message: &str) {
        self.log(message, "WARNING");
    }

    pub fn error(&self, message: &str) {
        self.log(message, "ERROR");
    }

    /// Flush buffered lines into the task row. Lines appear in append order;
    /// a flush with an empty buffer is a no-op.
    pub fn flush(&self, db: &Db) {
        let block = {
            let mut lines = self.lines.lock().unwrap();
            if lines.is_empty() {
                return;
            }
            let block = lines.join("\n");
            lines.clear();
            block
        };
        if let Err(e) = db.append_task_log(self.task_id, &block) {
            tracing::error!("Failed to flush task {} log: {}", self.task_id, e);
        }
    }
}

/// Parse a task-log line back into (timestamp, level, message).
/// Lines that don't match the written shape are returned whole.
pub fn parse_log_line(line: &str) -> (Option<chrono::NaiveDateTime>, Option<String>, &str) {
    let rest = match line.strip_prefix('[') {
        Some(rest) => rest,
        None => return (None, None, line),
    };
    let (timestamp_str, rest) = match rest.split_once("] [") {
        Some(parts) => parts,
        None => return (None, None, line),
    };
    let (level, message) = match rest.split_once("] ") {
        Some(parts) => parts,
        None => return (None, None, line),
    };

    let timestamp =
        chrono::NaiveDateTime::parse_from_str(timestamp_str, "%Y-%m-%dT%H:%M:%S%.3f").ok();
    (timestamp, Some(level.to_string()), message)
}
