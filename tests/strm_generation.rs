//! End-to-end STRM generation through the full pipeline:
//! upload -> parse -> create task -> run processor.

mod common;

use std::sync::Arc;

use strmgen::processor::actions::{self, CreateTaskParams};
use strmgen::processor::model::{SubTaskStatus, TaskStatus};
use strmgen::processor::Processor;
use strmgen::uploads;

fn create_params(record_id: i64, server_id: i64, output_dir: &str) -> CreateTaskParams {
    CreateTaskParams {
        record_id,
        server_id,
        download_server_id: None,
        output_dir: Some(output_dir.to_string()),
        name: None,
        worker_count: Some(2),
        created_by: 1,
    }
}

#[tokio::test]
async fn minimal_strm_task_completes() {
    let db = common::test_db();
    let out = tempfile::tempdir().unwrap();
    let out_dir = out.path().to_string_lossy().to_string();

    let server_id = common::seed_server(&db, "http://m");
    // rewrite is on by default; disable it to observe the raw URL
    let mut settings = db.get_settings().unwrap();
    settings.enable_path_replacement = false;
    db.save_settings(&settings).unwrap();

    let record =
        uploads::handle_upload(&db, "tree.txt", b"|root\n||movies\n|||a.mkv\n".to_vec(), 1).unwrap();
    uploads::parse_upload(&db, record.id, 1).unwrap();

    let task = actions::create_task(
        &db,
        out.path(),
        create_params(record.id, server_id, &out_dir),
    )
    .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);

    let processor = Processor::new(Arc::clone(&db));
    actions::start_task(&processor, task.id, 1).await.unwrap();

    let finished = db.get_task(task.id).unwrap().unwrap();
    assert_eq!(finished.status, TaskStatus::Completed);
    assert_eq!(finished.success_files, 1);
    assert_eq!(finished.failed_files, 0);
    assert!(finished.end_time.is_some());

    let strm = out.path().join("movies/a.strm");
    let content = std::fs::read_to_string(&strm).unwrap();
    assert_eq!(content, "http://m/movies/a.mkv");

    let sub = db.get_sub_task_by_source(task.id, "/movies/a.mkv").unwrap().unwrap();
    assert_eq!(sub.status, SubTaskStatus::Completed);
    assert_eq!(sub.target_path.as_deref(), Some(strm.to_str().unwrap()));
}

#[tokio::test]
async fn path_rewrite_changes_url_not_source_path() {
    let db = common::test_db();
    let out = tempfile::tempdir().unwrap();
    let out_dir = out.path().to_string_lossy().to_string();

    let server_id = common::seed_server(&db, "http://m");
    let mut settings = db.get_settings().unwrap();
    settings.enable_path_replacement = true;
    settings.replacement_path = "nas2".to_string();
    db.save_settings(&settings).unwrap();

    let record =
        uploads::handle_upload(&db, "tree.txt", b"|root\n||nas\n|||movies\n||||a.mkv\n".to_vec(), 1)
            .unwrap();
    uploads::parse_upload(&db, record.id, 1).unwrap();

    let task = actions::create_task(
        &db,
        out.path(),
        create_params(record.id, server_id, &out_dir),
    )
    .unwrap();

    let processor = Processor::new(Arc::clone(&db));
    actions::start_task(&processor, task.id, 1).await.unwrap();

    // first segment replaced in the URL, source path untouched
    let content = std::fs::read_to_string(out.path().join("nas/movies/a.strm")).unwrap();
    assert_eq!(content, "http://m/nas2/movies/a.mkv");
    let sub = db
        .get_sub_task_by_source(task.id, "/nas/movies/a.mkv")
        .unwrap()
        .unwrap();
    assert_eq!(sub.status, SubTaskStatus::Completed);
}

#[tokio::test]
async fn strm_url_is_percent_encoded() {
    let db = common::test_db();
    let out = tempfile::tempdir().unwrap();
    let out_dir = out.path().to_string_lossy().to_string();

    let server_id = common::seed_server(&db, "http://m");
    let mut settings = db.get_settings().unwrap();
    settings.enable_path_replacement = false;
    db.save_settings(&settings).unwrap();

    let blob = "|root\n||电影\n|||空格 文件.mkv\n".as_bytes().to_vec();
    let record = uploads::handle_upload(&db, "tree.txt", blob, 1).unwrap();
    uploads::parse_upload(&db, record.id, 1).unwrap();

    let task = actions::create_task(
        &db,
        out.path(),
        create_params(record.id, server_id, &out_dir),
    )
    .unwrap();
    let processor = Processor::new(Arc::clone(&db));
    actions::start_task(&processor, task.id, 1).await.unwrap();

    let content =
        std::fs::read_to_string(out.path().join("电影/空格 文件.strm")).unwrap();
    assert!(content.starts_with("http://m/"));
    assert!(!content.contains(' '));
    assert!(content.contains("%E7%94%B5%E5%BD%B1"));
}

#[tokio::test]
async fn empty_parse_result_completes_immediately() {
    let db = common::test_db();
    let out = tempfile::tempdir().unwrap();
    let out_dir = out.path().to_string_lossy().to_string();

    let server_id = common::seed_server(&db, "http://m");
    // only directories, nothing materialisable
    let record = uploads::handle_upload(&db, "tree.txt", b"|root\n||movies\n".to_vec(), 1).unwrap();
    uploads::parse_upload(&db, record.id, 1).unwrap();

    let task = actions::create_task(
        &db,
        out.path(),
        create_params(record.id, server_id, &out_dir),
    )
    .unwrap();
    let processor = Processor::new(Arc::clone(&db));
    actions::start_task(&processor, task.id, 1).await.unwrap();

    let finished = db.get_task(task.id).unwrap().unwrap();
    assert_eq!(finished.status, TaskStatus::Completed);
    assert_eq!(db.sub_task_counts(task.id).unwrap().total, 0);
    // the output directory is never created for an empty task
    assert!(!out.path().join("movies").exists());
}

#[tokio::test]
async fn other_typed_files_get_no_sub_tasks() {
    let db = common::test_db();
    let out = tempfile::tempdir().unwrap();
    let out_dir = out.path().to_string_lossy().to_string();

    let server_id = common::seed_server(&db, "http://m");
    let mut settings = db.get_settings().unwrap();
    settings.enable_path_replacement = false;
    db.save_settings(&settings).unwrap();

    let blob = b"|root\n||movies\n|||a.mkv\n|||archive.rar\n".to_vec();
    let record = uploads::handle_upload(&db, "tree.txt", blob, 1).unwrap();
    uploads::parse_upload(&db, record.id, 1).unwrap();

    let task = actions::create_task(
        &db,
        out.path(),
        create_params(record.id, server_id, &out_dir),
    )
    .unwrap();
    let processor = Processor::new(Arc::clone(&db));
    actions::start_task(&processor, task.id, 1).await.unwrap();

    let counts = db.sub_task_counts(task.id).unwrap();
    assert_eq!(counts.total, 1);
    assert!(db
        .get_sub_task_by_source(task.id, "/movies/archive.rar")
        .unwrap()
        .is_none());
}
