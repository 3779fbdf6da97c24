//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Path as AxumPath;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

use strmgen::db::{Db, MediaServer, ServerKind, ServerStatus};
use strmgen::parser::FileCategory;
use strmgen::processor::model::{
    now_local, ProcessKind, SubTask, SubTaskStatus, Task, TaskStatus,
};

pub fn test_db() -> Arc<Db> {
    Arc::new(Db::open_in_memory().unwrap())
}

pub fn seed_server(db: &Db, base_url: &str) -> i64 {
    let server = MediaServer {
        id: 0,
        name: "test server".to_string(),
        server_kind: ServerKind::Http,
        base_url: base_url.to_string(),
        description: None,
        auth_required: false,
        username: None,
        password: None,
        status: ServerStatus::Unknown,
        created_by: 1,
        created_at: now_local(),
    };
    db.insert_server(&server).unwrap()
}

pub fn make_task(db: &Db, server_id: i64, output_dir: &str, worker_count: u32) -> Task {
    let mut task = Task {
        id: 0,
        name: "fixture task".to_string(),
        status: TaskStatus::Pending,
        server_id,
        download_server_id: None,
        source_record_id: 1,
        output_dir: output_dir.to_string(),
        total_files: 0,
        processed_files: 0,
        success_files: 0,
        failed_files: 0,
        start_time: None,
        end_time: None,
        worker_count,
        log_content: String::new(),
        last_heartbeat: None,
        run_duration: None,
        created_by: 1,
        created_at: now_local(),
    };
    task.id = db.insert_task(&task).unwrap();
    task
}

pub fn make_sub_task(
    task_id: i64,
    source_path: &str,
    file_type: FileCategory,
    process_kind: ProcessKind,
    status: SubTaskStatus,
) -> SubTask {
    SubTask {
        id: 0,
        task_id,
        source_path: source_path.to_string(),
        target_path: None,
        file_type,
        process_kind,
        status,
        priority: 0,
        attempts: 0,
        max_attempts: 3,
        file_size: None,
        download_started: None,
        download_completed: None,
        duration: None,
        speed: None,
        worker_id: None,
        error_message: None,
        retry_after: None,
        updated_at: now_local(),
    }
}

/// Mark a task running as of `start_time`, the way task start does.
pub fn mark_running(db: &Db, task: &mut Task, start_time: chrono::NaiveDateTime) {
    task.status = TaskStatus::Running;
    task.start_time = Some(start_time);
    db.save_task(task).unwrap();
}

/// Serve fixed bodies keyed by path ("/show/poster.jpg" -> bytes).
/// Unknown paths return 404.
pub async fn spawn_file_server(files: HashMap<String, Vec<u8>>) -> SocketAddr {
    let files = Arc::new(files);
    let app = Router::new().route(
        "/*path",
        get(move |AxumPath(path): AxumPath<String>| {
            let files = Arc::clone(&files);
            async move {
                match files.get(&format!("/{}", path)) {
                    Some(body) => (StatusCode::OK, body.clone()),
                    None => (StatusCode::NOT_FOUND, Vec::new()),
                }
            }
        }),
    );
    serve(app).await
}

/// Serve the given status for every request.
pub async fn spawn_failing_server(status: u16) -> SocketAddr {
    let status = StatusCode::from_u16(status).unwrap();
    let app = Router::new().route(
        "/*path",
        get(move |AxumPath(_): AxumPath<String>| async move { (status, "upstream error") }),
    );
    serve(app).await
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}
