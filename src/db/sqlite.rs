use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::parser::FileCategory;
use crate::processor::model::{ProcessKind, SubTask, SubTaskStatus, Task, TaskStatus};
use crate::settings::{logging, Settings};

const DT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

fn fmt_dt(dt: NaiveDateTime) -> String {
    dt.format(DT_FORMAT).to_string()
}

fn parse_dt(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, DT_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}

fn opt_dt(value: Option<String>) -> Option<NaiveDateTime> {
    value.as_deref().and_then(parse_dt)
}

/// Echo a statement when the SQL-logging toggle is on
fn trace_sql(sql: &str) {
    if logging::sql_logging_enabled() {
        tracing::debug!(target: "strmgen::sql", "{}", sql);
    }
}

pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn: Arc::new(Mutex::new(conn)) };
        db.init()?;
        Ok(db)
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn: Arc::new(Mutex::new(conn)) };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        // Settings table (single row, id = 1)
        conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        // Media servers
        conn.execute(
            "CREATE TABLE IF NOT EXISTS media_servers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                server_kind TEXT NOT NULL,
                base_url TEXT NOT NULL,
                description TEXT,
                auth_required INTEGER NOT NULL DEFAULT 0,
                username TEXT,
                password TEXT,
                status TEXT NOT NULL DEFAULT 'unknown',
                created_by INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        // Upload records: the index blob is stored inline
        conn.execute(
            "CREATE TABLE IF NOT EXISTS upload_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL,
                filesize INTEGER NOT NULL,
                content BLOB NOT NULL,
                status TEXT NOT NULL,
                parsed_result TEXT,
                parse_time TEXT,
                file_path TEXT,
                uploader INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        // Parent tasks
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                server_id INTEGER NOT NULL,
                download_server_id INTEGER,
                source_record_id INTEGER NOT NULL,
                output_dir TEXT NOT NULL,
                total_files INTEGER NOT NULL DEFAULT 0,
                processed_files INTEGER NOT NULL DEFAULT 0,
                success_files INTEGER NOT NULL DEFAULT 0,
                failed_files INTEGER NOT NULL DEFAULT 0,
                start_time TEXT,
                end_time TEXT,
                worker_count INTEGER NOT NULL DEFAULT 1,
                log_content TEXT NOT NULL DEFAULT '',
                last_heartbeat TEXT,
                run_duration REAL,
                created_by INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        // Sub-tasks (one per file)
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sub_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                source_path TEXT NOT NULL,
                target_path TEXT,
                file_type TEXT NOT NULL,
                process_kind TEXT NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                file_size INTEGER,
                download_started TEXT,
                download_completed TEXT,
                duration REAL,
                speed REAL,
                worker_id TEXT,
                error_message TEXT,
                retry_after TEXT,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        // Per-artifact log streams
        conn.execute(
            "CREATE TABLE IF NOT EXISTS download_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                file_path TEXT NOT NULL,
                target_path TEXT,
                file_type TEXT NOT NULL,
                file_size INTEGER,
                download_time REAL,
                download_speed REAL,
                is_success INTEGER NOT NULL DEFAULT 1,
                log_level TEXT NOT NULL DEFAULT 'INFO',
                log_message TEXT NOT NULL,
                error_message TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS strm_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                source_path TEXT NOT NULL,
                target_path TEXT,
                file_type TEXT NOT NULL,
                is_success INTEGER NOT NULL DEFAULT 1,
                log_level TEXT NOT NULL DEFAULT 'INFO',
                log_message TEXT NOT NULL,
                error_message TEXT,
                generation_time REAL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        // Indexes for the hot sub-task filters
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sub_tasks_task ON sub_tasks(task_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sub_tasks_status ON sub_tasks(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sub_tasks_task_kind_status
             ON sub_tasks(task_id, process_kind, status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_download_logs_task ON download_logs(task_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_strm_logs_task ON strm_logs(task_id)",
            [],
        )?;

        Ok(())
    }

    // ========================================================================
    // Settings (singleton row)
    // ========================================================================

    /// Load the settings row, creating the default row on first access.
    pub fn get_settings(&self) -> Result<Settings> {
        let conn = self.conn.lock().unwrap();
        trace_sql("SELECT data FROM settings WHERE id = 1");
        let row: Option<String> = conn
            .query_row("SELECT data FROM settings WHERE id = 1", [], |row| row.get(0))
            .optional()?;

        match row {
            Some(json) => Ok(serde_json::from_str(&json).unwrap_or_default()),
            None => {
                let settings = Settings::default();
                let json = serde_json::to_string(&settings)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?;
                conn.execute(
                    "INSERT INTO settings (id, data, updated_at) VALUES (1, ?1, ?2)",
                    params![json, fmt_dt(crate::processor::model::now_local())],
                )?;
                Ok(settings)
            }
        }
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let json = serde_json::to_string(settings).map_err(|_| rusqlite::Error::InvalidQuery)?;
        trace_sql("INSERT OR REPLACE INTO settings ...");
        conn.execute(
            "INSERT OR REPLACE INTO settings (id, data, updated_at) VALUES (1, ?1, ?2)",
            params![json, fmt_dt(crate::processor::model::now_local())],
        )?;
        Ok(())
    }

    // ========================================================================
    // Media servers
    // ========================================================================

    pub fn insert_server(&self, server: &MediaServer) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO media_servers (
                name, server_kind, base_url, description, auth_required,
                username, password, status, created_by, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                server.name,
                server.server_kind.as_str(),
                server.base_url,
                server.description,
                server.auth_required as i64,
                server.username,
                server.password,
                server.status.as_str(),
                server.created_by,
                fmt_dt(server.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_server(&self, server: &MediaServer) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE media_servers SET
                name = ?1, server_kind = ?2, base_url = ?3, description = ?4,
                auth_required = ?5, username = ?6, password = ?7, status = ?8
             WHERE id = ?9",
            params![
                server.name,
                server.server_kind.as_str(),
                server.base_url,
                server.description,
                server.auth_required as i64,
                server.username,
                server.password,
                server.status.as_str(),
                server.id,
            ],
        )?;
        Ok(())
    }

    fn parse_server_from_row(row: &rusqlite::Row) -> rusqlite::Result<MediaServer> {
        let created_at_str: String = row.get(10)?;
        Ok(MediaServer {
            id: row.get(0)?,
            name: row.get(1)?,
            server_kind: ServerKind::from_str(&row.get::<_, String>(2)?),
            base_url: row.get(3)?,
            description: row.get(4)?,
            auth_required: row.get::<_, i64>(5)? != 0,
            username: row.get(6)?,
            password: row.get(7)?,
            status: ServerStatus::from_str(&row.get::<_, String>(8)?),
            created_by: row.get(9)?,
            created_at: parse_dt(&created_at_str).unwrap_or_default(),
        })
    }

    const SERVER_COLUMNS: &'static str = "id, name, server_kind, base_url, description, \
        auth_required, username, password, status, created_by, created_at";

    pub fn get_server(&self, id: i64) -> Result<Option<MediaServer>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM media_servers WHERE id = ?1",
            Self::SERVER_COLUMNS
        );
        trace_sql(&sql);
        conn.query_row(&sql, params![id], Self::parse_server_from_row)
            .optional()
    }

    pub fn list_servers(&self) -> Result<Vec<MediaServer>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM media_servers ORDER BY id",
            Self::SERVER_COLUMNS
        );
        trace_sql(&sql);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::parse_server_from_row)?;
        rows.collect()
    }

    pub fn set_server_status(&self, id: i64, status: ServerStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE media_servers SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    pub fn delete_server(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM media_servers WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ========================================================================
    // Upload records
    // ========================================================================

    pub fn insert_upload(&self, record: &UploadRecord) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO upload_records (
                filename, filesize, content, status, parsed_result,
                parse_time, file_path, uploader, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.filename,
                record.filesize,
                record.content,
                record.status.as_str(),
                record.parsed_result,
                record.parse_time.map(fmt_dt),
                record.file_path,
                record.uploader,
                fmt_dt(record.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn parse_upload_from_row(row: &rusqlite::Row) -> rusqlite::Result<UploadRecord> {
        Ok(UploadRecord {
            id: row.get(0)?,
            filename: row.get(1)?,
            filesize: row.get(2)?,
            content: row.get(3)?,
            status: UploadStatus::from_str(&row.get::<_, String>(4)?),
            parsed_result: row.get(5)?,
            parse_time: opt_dt(row.get(6)?),
            file_path: row.get(7)?,
            uploader: row.get(8)?,
            created_at: opt_dt(row.get::<_, Option<String>>(9)?).unwrap_or_default(),
        })
    }

    const UPLOAD_COLUMNS: &'static str = "id, filename, filesize, content, status, \
        parsed_result, parse_time, file_path, uploader, created_at";

    pub fn get_upload(&self, id: i64) -> Result<Option<UploadRecord>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM upload_records WHERE id = ?1",
            Self::UPLOAD_COLUMNS
        );
        trace_sql(&sql);
        conn.query_row(&sql, params![id], Self::parse_upload_from_row)
            .optional()
    }

    /// Paginated upload listing for one uploader, newest first
    pub fn list_uploads(&self, uploader: i64, page: u32, page_size: u32) -> Result<(Vec<UploadRecord>, u64)> {
        let conn = self.conn.lock().unwrap();
        let total: u64 = conn.query_row(
            "SELECT COUNT(*) FROM upload_records WHERE uploader = ?1",
            params![uploader],
            |row| row.get(0),
        )?;

        let offset = (page.saturating_sub(1)) * page_size;
        let sql = format!(
            "SELECT {} FROM upload_records WHERE uploader = ?1
             ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
            Self::UPLOAD_COLUMNS
        );
        trace_sql(&sql);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![uploader, page_size as i64, offset as i64],
            Self::parse_upload_from_row,
        )?;
        Ok((rows.collect::<Result<Vec<_>>>()?, total))
    }

    pub fn update_upload_status(&self, id: i64, status: UploadStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE upload_records SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    /// Persist a parse result atomically with the parsed state
    pub fn save_parse_result(&self, id: i64, result_json: &str, parse_time: NaiveDateTime) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE upload_records SET status = ?1, parsed_result = ?2, parse_time = ?3 WHERE id = ?4",
            params![UploadStatus::Parsed.as_str(), result_json, fmt_dt(parse_time), id],
        )?;
        Ok(())
    }

    /// Rewrite only the cached parse result (read-time re-typing)
    pub fn update_parse_result(&self, id: i64, result_json: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE upload_records SET parsed_result = ?1 WHERE id = ?2",
            params![result_json, id],
        )?;
        Ok(())
    }

    pub fn delete_upload(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM upload_records WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    const TASK_COLUMNS: &'static str = "id, name, status, server_id, download_server_id, \
        source_record_id, output_dir, total_files, processed_files, success_files, \
        failed_files, start_time, end_time, worker_count, log_content, last_heartbeat, \
        run_duration, created_by, created_at";

    fn parse_task_from_row(row: &rusqlite::Row) -> rusqlite::Result<Task> {
        Ok(Task {
            id: row.get(0)?,
            name: row.get(1)?,
            status: TaskStatus::from_str(&row.get::<_, String>(2)?),
            server_id: row.get(3)?,
            download_server_id: row.get(4)?,
            source_record_id: row.get(5)?,
            output_dir: row.get(6)?,
            total_files: row.get(7)?,
            processed_files: row.get(8)?,
            success_files: row.get(9)?,
            failed_files: row.get(10)?,
            start_time: opt_dt(row.get(11)?),
            end_time: opt_dt(row.get(12)?),
            worker_count: row.get::<_, i64>(13)? as u32,
            log_content: row.get(14)?,
            last_heartbeat: opt_dt(row.get(15)?),
            run_duration: row.get(16)?,
            created_by: row.get(17)?,
            created_at: opt_dt(row.get::<_, Option<String>>(18)?).unwrap_or_default(),
        })
    }

    pub fn insert_task(&self, task: &Task) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tasks (
                name, status, server_id, download_server_id, source_record_id,
                output_dir, total_files, processed_files, success_files, failed_files,
                start_time, end_time, worker_count, log_content, last_heartbeat,
                run_duration, created_by, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                task.name,
                task.status.as_str(),
                task.server_id,
                task.download_server_id,
                task.source_record_id,
                task.output_dir,
                task.total_files,
                task.processed_files,
                task.success_files,
                task.failed_files,
                task.start_time.map(fmt_dt),
                task.end_time.map(fmt_dt),
                task.worker_count as i64,
                task.log_content,
                task.last_heartbeat.map(fmt_dt),
                task.run_duration,
                task.created_by,
                fmt_dt(task.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn save_task(&self, task: &Task) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        trace_sql("UPDATE tasks SET ... WHERE id = ?");
        conn.execute(
            "UPDATE tasks SET
                name = ?1, status = ?2, server_id = ?3, download_server_id = ?4,
                source_record_id = ?5, output_dir = ?6, total_files = ?7,
                processed_files = ?8, success_files = ?9, failed_files = ?10,
                start_time = ?11, end_time = ?12, worker_count = ?13,
                last_heartbeat = ?14, run_duration = ?15
             WHERE id = ?16",
            params![
                task.name,
                task.status.as_str(),
                task.server_id,
                task.download_server_id,
                task.source_record_id,
                task.output_dir,
                task.total_files,
                task.processed_files,
                task.success_files,
                task.failed_files,
                task.start_time.map(fmt_dt),
                task.end_time.map(fmt_dt),
                task.worker_count as i64,
                task.last_heartbeat.map(fmt_dt),
                task.run_duration,
                task.id,
            ],
        )?;
        Ok(())
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", Self::TASK_COLUMNS);
        trace_sql(&sql);
        conn.query_row(&sql, params![id], Self::parse_task_from_row)
            .optional()
    }

    pub fn update_task_status(&self, id: i64, status: TaskStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tasks SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    /// Refresh a task heartbeat. The guard keeps the stored value monotonic
    /// even when a stale writer races a fresher one.
    pub fn touch_task_heartbeat(&self, id: i64, now: NaiveDateTime) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tasks SET last_heartbeat = ?1
             WHERE id = ?2 AND (last_heartbeat IS NULL OR last_heartbeat < ?1)",
            params![fmt_dt(now), id],
        )?;
        Ok(())
    }

    /// Append a block of log lines to the task's append-only log column
    pub fn append_task_log(&self, id: i64, block: &str) -> Result<()> {
        if block.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tasks SET log_content = CASE
                WHEN log_content = '' THEN ?1
                ELSE log_content || char(10) || ?1
             END WHERE id = ?2",
            params![block, id],
        )?;
        Ok(())
    }

    pub fn get_task_log(&self, id: i64) -> Result<String> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT log_content FROM tasks WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
    }

    pub fn running_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM tasks WHERE status = 'running'",
            Self::TASK_COLUMNS
        );
        trace_sql(&sql);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::parse_task_from_row)?;
        rows.collect()
    }

    /// Paginated task listing filtered by owner, status and name search
    pub fn list_tasks(
        &self,
        created_by: i64,
        status: Option<TaskStatus>,
        search: Option<&str>,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<Task>, u64)> {
        let conn = self.conn.lock().unwrap();

        // Empty filter values deactivate their clause; parameter count stays fixed
        let where_clause = "WHERE created_by = ?1
            AND (?2 = '' OR status = ?2)
            AND (?3 = '' OR name LIKE '%' || ?3 || '%')";

        let status_str = status.map(|s| s.as_str().to_string()).unwrap_or_default();
        let search_str = search.unwrap_or_default().to_string();

        let count_sql = format!("SELECT COUNT(*) FROM tasks {}", where_clause);
        let total: u64 = conn.query_row(
            &count_sql,
            params![created_by, status_str, search_str],
            |row| row.get(0),
        )?;

        let offset = (page.saturating_sub(1)) * page_size;
        let sql = format!(
            "SELECT {} FROM tasks {} ORDER BY created_at DESC LIMIT ?4 OFFSET ?5",
            Self::TASK_COLUMNS,
            where_clause
        );
        trace_sql(&sql);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![created_by, status_str, search_str, page_size as i64, offset as i64],
            Self::parse_task_from_row,
        )?;
        Ok((rows.collect::<Result<Vec<_>>>()?, total))
    }

    /// Async version of list_tasks - uses spawn_blocking
    pub async fn list_tasks_async(
        &self,
        created_by: i64,
        status: Option<TaskStatus>,
        search: Option<String>,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<Task>, u64)> {
        let db = Db { conn: Arc::clone(&self.conn) };
        tokio::task::spawn_blocking(move || {
            db.list_tasks(created_by, status, search.as_deref(), page, page_size)
        })
        .await
        .unwrap()
    }

    /// Delete a task together with its sub-tasks and artifact logs
    pub fn delete_task_cascade(&self, id: i64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM sub_tasks WHERE task_id = ?1", params![id])?;
        tx.execute("DELETE FROM download_logs WHERE task_id = ?1", params![id])?;
        tx.execute("DELETE FROM strm_logs WHERE task_id = ?1", params![id])?;
        tx.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        tx.commit()
    }

    // ========================================================================
    // Sub-tasks
    // ========================================================================

    const SUB_TASK_COLUMNS: &'static str = "id, task_id, source_path, target_path, file_type, \
        process_kind, status, priority, attempts, max_attempts, file_size, download_started, \
        download_completed, duration, speed, worker_id, error_message, retry_after, updated_at";

    fn parse_sub_task_from_row(row: &rusqlite::Row) -> rusqlite::Result<SubTask> {
        Ok(SubTask {
            id: row.get(0)?,
            task_id: row.get(1)?,
            source_path: row.get(2)?,
            target_path: row.get(3)?,
            file_type: FileCategory::from_str(&row.get::<_, String>(4)?),
            process_kind: ProcessKind::from_str(&row.get::<_, String>(5)?),
            status: SubTaskStatus::from_str(&row.get::<_, String>(6)?),
            priority: row.get(7)?,
            attempts: row.get::<_, i64>(8)? as u32,
            max_attempts: row.get::<_, i64>(9)? as u32,
            file_size: row.get(10)?,
            download_started: opt_dt(row.get(11)?),
            download_completed: opt_dt(row.get(12)?),
            duration: row.get(13)?,
            speed: row.get(14)?,
            worker_id: row.get(15)?,
            error_message: row.get(16)?,
            retry_after: opt_dt(row.get(17)?),
            updated_at: opt_dt(row.get::<_, Option<String>>(18)?).unwrap_or_default(),
        })
    }

    /// Persist the task transition to running together with its expanded
    /// sub-task list in one transaction.
    pub fn insert_sub_tasks(&self, task: &Task, sub_tasks: &[SubTask]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO sub_tasks (
                    task_id, source_path, target_path, file_type, process_kind, status,
                    priority, attempts, max_attempts, file_size, download_started,
                    download_completed, duration, speed, worker_id, error_message,
                    retry_after, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            )?;
            for sub in sub_tasks {
                stmt.execute(params![
                    sub.task_id,
                    sub.source_path,
                    sub.target_path,
                    sub.file_type.as_str(),
                    sub.process_kind.as_str(),
                    sub.status.as_str(),
                    sub.priority,
                    sub.attempts as i64,
                    sub.max_attempts as i64,
                    sub.file_size,
                    sub.download_started.map(fmt_dt),
                    sub.download_completed.map(fmt_dt),
                    sub.duration,
                    sub.speed,
                    sub.worker_id,
                    sub.error_message,
                    sub.retry_after.map(fmt_dt),
                    fmt_dt(sub.updated_at),
                ])?;
            }
        }
        tx.execute(
            "UPDATE tasks SET status = ?1, total_files = ?2, start_time = ?3, last_heartbeat = ?3
             WHERE id = ?4",
            params![
                task.status.as_str(),
                task.total_files,
                task.start_time.map(fmt_dt),
                task.id
            ],
        )?;
        tx.commit()
    }

    pub fn save_sub_task(&self, sub: &SubTask) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        trace_sql("UPDATE sub_tasks SET ... WHERE id = ?");
        conn.execute(
            "UPDATE sub_tasks SET
                target_path = ?1, file_type = ?2, process_kind = ?3, status = ?4,
                priority = ?5, attempts = ?6, max_attempts = ?7, file_size = ?8,
                download_started = ?9, download_completed = ?10, duration = ?11,
                speed = ?12, worker_id = ?13, error_message = ?14, retry_after = ?15,
                updated_at = ?16
             WHERE id = ?17",
            params![
                sub.target_path,
                sub.file_type.as_str(),
                sub.process_kind.as_str(),
                sub.status.as_str(),
                sub.priority,
                sub.attempts as i64,
                sub.max_attempts as i64,
                sub.file_size,
                sub.download_started.map(fmt_dt),
                sub.download_completed.map(fmt_dt),
                sub.duration,
                sub.speed,
                sub.worker_id,
                sub.error_message,
                sub.retry_after.map(fmt_dt),
                fmt_dt(sub.updated_at),
                sub.id,
            ],
        )?;
        Ok(())
    }

    pub fn get_sub_task(&self, id: i64) -> Result<Option<SubTask>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM sub_tasks WHERE id = ?1", Self::SUB_TASK_COLUMNS);
        conn.query_row(&sql, params![id], Self::parse_sub_task_from_row)
            .optional()
    }

    pub fn get_sub_task_by_source(&self, task_id: i64, source_path: &str) -> Result<Option<SubTask>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM sub_tasks WHERE task_id = ?1 AND source_path = ?2",
            Self::SUB_TASK_COLUMNS
        );
        conn.query_row(&sql, params![task_id, source_path], Self::parse_sub_task_from_row)
            .optional()
    }

    pub fn sub_tasks_for_task(&self, task_id: i64) -> Result<Vec<SubTask>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM sub_tasks WHERE task_id = ?1 ORDER BY id",
            Self::SUB_TASK_COLUMNS
        );
        trace_sql(&sql);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![task_id], Self::parse_sub_task_from_row)?;
        rows.collect()
    }

    /// Paginated sub-task listing with type/status filters and free-text
    /// search over the source path.
    pub fn list_sub_tasks(
        &self,
        task_id: i64,
        file_type: Option<FileCategory>,
        status: Option<SubTaskStatus>,
        search: Option<&str>,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<SubTask>, u64)> {
        let conn = self.conn.lock().unwrap();

        // Empty filter values deactivate their clause; parameter count stays fixed
        let where_clause = "WHERE task_id = ?1
            AND (?2 = '' OR file_type = ?2)
            AND (?3 = '' OR status = ?3)
            AND (?4 = '' OR source_path LIKE '%' || ?4 || '%')";

        let type_str = file_type.map(|t| t.as_str().to_string()).unwrap_or_default();
        let status_str = status.map(|s| s.as_str().to_string()).unwrap_or_default();
        let search_str = search.unwrap_or_default().to_string();

        let count_sql = format!("SELECT COUNT(*) FROM sub_tasks {}", where_clause);
        let total: u64 = conn.query_row(
            &count_sql,
            params![task_id, type_str, status_str, search_str],
            |row| row.get(0),
        )?;

        let offset = (page.saturating_sub(1)) * page_size;
        let sql = format!(
            "SELECT {} FROM sub_tasks {} ORDER BY id LIMIT ?5 OFFSET ?6",
            Self::SUB_TASK_COLUMNS,
            where_clause
        );
        trace_sql(&sql);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![task_id, type_str, status_str, search_str, page_size as i64, offset as i64],
            Self::parse_sub_task_from_row,
        )?;
        Ok((rows.collect::<Result<Vec<_>>>()?, total))
    }

    /// Async version of list_sub_tasks - uses spawn_blocking
    pub async fn list_sub_tasks_async(
        &self,
        task_id: i64,
        file_type: Option<FileCategory>,
        status: Option<SubTaskStatus>,
        search: Option<String>,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<SubTask>, u64)> {
        let db = Db { conn: Arc::clone(&self.conn) };
        tokio::task::spawn_blocking(move || {
            db.list_sub_tasks(task_id, file_type, status, search.as_deref(), page, page_size)
        })
        .await
        .unwrap()
    }

    /// Sub-tasks a processor phase may run now: pending, or retry whose
    /// backoff has expired (or was never set).
    pub fn runnable_sub_tasks(
        &self,
        task_id: i64,
        kind: ProcessKind,
        now: NaiveDateTime,
    ) -> Result<Vec<SubTask>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM sub_tasks
             WHERE task_id = ?1 AND process_kind = ?2
               AND (status = 'pending'
                    OR (status = 'retry' AND (retry_after IS NULL OR retry_after <= ?3)))
             ORDER BY priority, id",
            Self::SUB_TASK_COLUMNS
        );
        trace_sql(&sql);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![task_id, kind.as_str(), fmt_dt(now)],
            Self::parse_sub_task_from_row,
        )?;
        rows.collect()
    }

    /// All retry sub-tasks whose backoff expired, across every task
    pub fn due_retry_sub_tasks(&self, now: NaiveDateTime) -> Result<Vec<SubTask>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM sub_tasks
             WHERE status = 'retry' AND (retry_after IS NULL OR retry_after <= ?1)
             ORDER BY task_id, id",
            Self::SUB_TASK_COLUMNS
        );
        trace_sql(&sql);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![fmt_dt(now)], Self::parse_sub_task_from_row)?;
        rows.collect()
    }

    pub fn downloading_sub_tasks(&self) -> Result<Vec<SubTask>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM sub_tasks WHERE status = 'downloading'",
            Self::SUB_TASK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::parse_sub_task_from_row)?;
        rows.collect()
    }

    /// Bulk cancel every non-terminal sub-task of a parent
    pub fn cancel_open_sub_tasks(&self, task_id: i64, reason: &str, now: NaiveDateTime) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE sub_tasks SET status = 'canceled', error_message = ?1, updated_at = ?2
             WHERE task_id = ?3 AND status IN ('pending', 'downloading', 'retry')",
            params![reason, fmt_dt(now), task_id],
        )?;
        Ok(changed)
    }

    /// Bulk fail every non-terminal sub-task of a parent (recovery path)
    pub fn fail_open_sub_tasks(&self, task_id: i64, reason: &str, now: NaiveDateTime) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE sub_tasks SET status = 'failed', error_message = ?1, updated_at = ?2
             WHERE task_id = ?3 AND status IN ('pending', 'downloading', 'retry')",
            params![reason, fmt_dt(now), task_id],
        )?;
        Ok(changed)
    }

    /// Per-kind, per-status counts for one task
    pub fn sub_task_counts(&self, task_id: i64) -> Result<SubTaskCounts> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT process_kind, status, COUNT(*) FROM sub_tasks
             WHERE task_id = ?1 GROUP BY process_kind, status",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut counts = SubTaskCounts::default();
        for row in rows {
            let (kind, status, count) = row?;
            counts.total += count;
            match SubTaskStatus::from_str(&status) {
                SubTaskStatus::Completed => {
                    counts.completed += count;
                    if kind == "strm_generation" {
                        counts.strm_completed += count;
                    } else {
                        counts.resource_completed += count;
                    }
                }
                SubTaskStatus::Failed => {
                    counts.failed += count;
                    if kind == "strm_generation" {
                        counts.strm_failed += count;
                    } else {
                        counts.resource_failed += count;
                    }
                }
                SubTaskStatus::Canceled => counts.canceled += count,
                SubTaskStatus::Pending => counts.pending += count,
                SubTaskStatus::Downloading => counts.downloading += count,
                SubTaskStatus::Retry => counts.retry += count,
            }
        }
        Ok(counts)
    }

    /// Count of sub-tasks of a task updated at or after `since`
    pub fn sub_tasks_updated_since(&self, task_id: i64, since: NaiveDateTime) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM sub_tasks WHERE task_id = ?1 AND updated_at >= ?2",
            params![task_id, fmt_dt(since)],
            |row| row.get(0),
        )
    }

    // ========================================================================
    // Artifact log streams
    // ========================================================================

    pub fn insert_download_log(&self, entry: &DownloadLogEntry) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO download_logs (
                task_id, file_path, target_path, file_type, file_size, download_time,
                download_speed, is_success, log_level, log_message, error_message, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                entry.task_id,
                entry.file_path,
                entry.target_path,
                entry.file_type.as_str(),
                entry.file_size,
                entry.download_time,
                entry.download_speed,
                entry.is_success as i64,
                entry.log_level,
                entry.log_message,
                entry.error_message,
                fmt_dt(entry.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn insert_strm_log(&self, entry: &StrmLogEntry) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO strm_logs (
                task_id, source_path, target_path, file_type, is_success,
                log_level, log_message, error_message, generation_time, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.task_id,
                entry.source_path,
                entry.target_path,
                entry.file_type.as_str(),
                entry.is_success as i64,
                entry.log_level,
                entry.log_message,
                entry.error_message,
                entry.generation_time,
                fmt_dt(entry.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn download_logs_for_task(
        &self,
        task_id: i64,
        level: Option<&str>,
        search: Option<&str>,
    ) -> Result<Vec<DownloadLogEntry>> {
        let conn = self.conn.lock().unwrap();
        let where_clause = "WHERE task_id = ?1
            AND (?2 = '' OR log_level = ?2)
            AND (?3 = '' OR log_message LIKE '%' || ?3 || '%')";
        let level_str = level.map(|l| l.to_uppercase()).unwrap_or_default();
        let search_str = search.unwrap_or_default().to_string();

        let sql = format!(
            "SELECT task_id, file_path, target_path, file_type, file_size, download_time,
                    download_speed, is_success, log_level, log_message, error_message, created_at
             FROM download_logs {} ORDER BY created_at, id",
            where_clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![task_id, level_str, search_str], |row| {
            Ok(DownloadLogEntry {
                task_id: row.get(0)?,
                file_path: row.get(1)?,
                target_path: row.get(2)?,
                file_type: FileCategory::from_str(&row.get::<_, String>(3)?),
                file_size: row.get(4)?,
                download_time: row.get(5)?,
                download_speed: row.get(6)?,
                is_success: row.get::<_, i64>(7)? != 0,
                log_level: row.get(8)?,
                log_message: row.get(9)?,
                error_message: row.get(10)?,
                created_at: opt_dt(row.get::<_, Option<String>>(11)?).unwrap_or_default(),
            })
        })?;
        rows.collect()
    }

    pub fn strm_logs_for_task(
        &self,
        task_id: i64,
        level: Option<&str>,
        search: Option<&str>,
    ) -> Result<Vec<StrmLogEntry>> {
        let conn = self.conn.lock().unwrap();
        let where_clause = "WHERE task_id = ?1
            AND (?2 = '' OR log_level = ?2)
            AND (?3 = '' OR log_message LIKE '%' || ?3 || '%')";
        let level_str = level.map(|l| l.to_uppercase()).unwrap_or_default();
        let search_str = search.unwrap_or_default().to_string();

        let sql = format!(
            "SELECT task_id, source_path, target_path, file_type, is_success, log_level,
                    log_message, error_message, generation_time, created_at
             FROM strm_logs {} ORDER BY created_at, id",
            where_clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![task_id, level_str, search_str], |row| {
            Ok(StrmLogEntry {
                task_id: row.get(0)?,
                source_path: row.get(1)?,
                target_path: row.get(2)?,
                file_type: FileCategory::from_str(&row.get::<_, String>(3)?),
                is_success: row.get::<_, i64>(4)? != 0,
                log_level: row.get(5)?,
                log_message: row.get(6)?,
                error_message: row.get(7)?,
                generation_time: row.get(8)?,
                created_at: opt_dt(row.get::<_, Option<String>>(9)?).unwrap_or_default(),
            })
        })?;
        rows.collect()
    }
}

// ============================================================================
// Row types
// ============================================================================

/// Kind of media/download server a task streams from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Http,
    Https,
    Cd2host,
    Xiaoyahost,
    Ftp,
    Webdav,
    Local,
}

impl ServerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Cd2host => "cd2host",
            Self::Xiaoyahost => "xiaoyahost",
            Self::Ftp => "ftp",
            Self::Webdav => "webdav",
            Self::Local => "local",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "https" => Self::Https,
            "cd2host" => Self::Cd2host,
            "xiaoyahost" => Self::Xiaoyahost,
            "ftp" => Self::Ftp,
            "webdav" => Self::Webdav,
            "local" => Self::Local,
            _ => Self::Http,
        }
    }
}

/// Last known reachability of a server
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Unknown,
    Success,
    Error,
    Warning,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Success => "success",
            Self::Error => "error",
            Self::Warning => "warning",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "error" => Self::Error,
            "warning" => Self::Warning,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaServer {
    pub id: i64,
    pub name: String,
    pub server_kind: ServerKind,
    pub base_url: String,
    pub description: Option<String>,
    pub auth_required: bool,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub status: ServerStatus,
    pub created_by: i64,
    pub created_at: NaiveDateTime,
}

/// Lifecycle of an uploaded index file
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploaded,
    Parsing,
    Parsed,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Parsing => "parsing",
            Self::Parsed => "parsed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "parsing" => Self::Parsing,
            "parsed" => Self::Parsed,
            "failed" => Self::Failed,
            _ => Self::Uploaded,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: i64,
    pub filename: String,
    pub filesize: i64,
    #[serde(skip_serializing)]
    pub content: Vec<u8>,
    pub status: UploadStatus,
    /// Cached ParseResult JSON document
    pub parsed_result: Option<String>,
    pub parse_time: Option<NaiveDateTime>,
    /// Legacy on-disk location kept for old rows
    pub file_path: Option<String>,
    pub uploader: i64,
    pub created_at: NaiveDateTime,
}

/// Aggregated sub-task counts for one task
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SubTaskCounts {
    pub total: i64,
    pub pending: i64,
    pub downloading: i64,
    pub completed: i64,
    pub failed: i64,
    pub canceled: i64,
    pub retry: i64,
    pub strm_completed: i64,
    pub strm_failed: i64,
    pub resource_completed: i64,
    pub resource_failed: i64,
}

impl SubTaskCounts {
    /// Processed = terminal successes plus terminal failures
    pub fn processed(&self) -> i64 {
        self.completed + self.failed
    }

    pub fn open(&self) -> i64 {
        self.pending + self.downloading + self.retry
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadLogEntry {
    pub task_id: i64,
    pub file_path: String,
    pub target_path: Option<String>,
    pub file_type: FileCategory,
    pub file_size: Option<i64>,
    pub download_time: Option<f64>,
    pub download_speed: Option<f64>,
    pub is_success: bool,
    pub log_level: String,
    pub log_message: String,
    pub error_message: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrmLogEntry {
    pub task_id: i64,
    pub source_path: String,
    pub target_path: Option<String>,
    pub file_type: FileCategory,
    pub is_success: bool,
    pub log_level: String,
    pub log_message: String,
    pub error_message: Option<String>,
    pub generation_time: Option<f64>,
    pub created_at: NaiveDateTime,
}
