//! Cancel and continue lifecycle semantics.

mod common;

use std::sync::Arc;

use strmgen::error::StrmgenError;
use strmgen::parser::FileCategory;
use strmgen::processor::actions;
use strmgen::processor::model::{now_local, ProcessKind, SubTaskStatus, TaskStatus};
use strmgen::processor::Processor;

#[tokio::test]
async fn cancel_running_task_cancels_open_sub_tasks() {
    let db = common::test_db();
    let server_id = common::seed_server(&db, "http://m");
    let mut task = common::make_task(&db, server_id, "/tmp/out", 1);

    let subs = vec![
        common::make_sub_task(task.id, "/a.mkv", FileCategory::Video, ProcessKind::StrmGeneration, SubTaskStatus::Completed),
        common::make_sub_task(task.id, "/b.mkv", FileCategory::Video, ProcessKind::StrmGeneration, SubTaskStatus::Pending),
        common::make_sub_task(task.id, "/c.jpg", FileCategory::Image, ProcessKind::ResourceDownload, SubTaskStatus::Downloading),
        common::make_sub_task(task.id, "/d.jpg", FileCategory::Image, ProcessKind::ResourceDownload, SubTaskStatus::Retry),
    ];
    db.insert_sub_tasks(&task, &subs).unwrap();
    common::mark_running(&db, &mut task, now_local());

    let outcome = actions::cancel_task(&db, task.id, 1).unwrap();
    assert_eq!(outcome.canceled_sub_tasks, 3);

    let canceled = db.get_task(task.id).unwrap().unwrap();
    assert_eq!(canceled.status, TaskStatus::Canceled);
    assert!(canceled.end_time.is_some());

    let counts = db.sub_task_counts(task.id).unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.canceled, 3);

    // the user action is visible in the task log
    assert!(db.get_task_log(task.id).unwrap().contains("Task canceled by user"));
}

#[tokio::test]
async fn cancel_is_gated_on_lifecycle_state() {
    let db = common::test_db();
    let server_id = common::seed_server(&db, "http://m");
    let mut task = common::make_task(&db, server_id, "/tmp/out", 1);
    common::mark_running(&db, &mut task, now_local());

    actions::cancel_task(&db, task.id, 1).unwrap();

    // second cancel hits the precondition gate
    let err = actions::cancel_task(&db, task.id, 1).unwrap_err();
    assert!(matches!(err, StrmgenError::PreconditionFailed { .. }));

    // a completed task cannot be canceled either
    let mut done = common::make_task(&db, server_id, "/tmp/out2", 1);
    done.status = TaskStatus::Completed;
    db.save_task(&done).unwrap();
    let err = actions::cancel_task(&db, done.id, 1).unwrap_err();
    assert!(matches!(err, StrmgenError::PreconditionFailed { .. }));
}

#[tokio::test]
async fn cancel_requires_ownership() {
    let db = common::test_db();
    let server_id = common::seed_server(&db, "http://m");
    let mut task = common::make_task(&db, server_id, "/tmp/out", 1);
    common::mark_running(&db, &mut task, now_local());

    let err = actions::cancel_task(&db, task.id, 42).unwrap_err();
    assert!(matches!(err, StrmgenError::PermissionDenied(_)));
}

#[tokio::test]
async fn continue_keeps_promotes_and_resets() {
    let db = common::test_db();
    let out = tempfile::tempdir().unwrap();
    let server_id = common::seed_server(&db, "http://m");
    let mut task = common::make_task(&db, server_id, out.path().to_str().unwrap(), 1);

    // two completed with surviving strm stubs
    let kept_a = out.path().join("a.strm");
    let kept_b = out.path().join("b.strm");
    std::fs::write(&kept_a, "http://m/a.mkv").unwrap();
    std::fs::write(&kept_b, "http://m/b.mkv").unwrap();

    // one canceled whose artifact survived intact
    let promoted = out.path().join("c.strm");
    std::fs::write(&promoted, "http://m/c.mkv").unwrap();

    let mut subs = vec![
        common::make_sub_task(task.id, "/a.mkv", FileCategory::Video, ProcessKind::StrmGeneration, SubTaskStatus::Completed),
        common::make_sub_task(task.id, "/b.mkv", FileCategory::Video, ProcessKind::StrmGeneration, SubTaskStatus::Completed),
        common::make_sub_task(task.id, "/c.mkv", FileCategory::Video, ProcessKind::StrmGeneration, SubTaskStatus::Canceled),
    ];
    subs[0].target_path = Some(kept_a.to_string_lossy().to_string());
    subs[1].target_path = Some(kept_b.to_string_lossy().to_string());
    subs[2].target_path = Some(promoted.to_string_lossy().to_string());

    // four canceled with missing artifacts
    for name in ["d", "e", "f", "g"] {
        let mut sub = common::make_sub_task(
            task.id,
            &format!("/{}.mkv", name),
            FileCategory::Video,
            ProcessKind::StrmGeneration,
            SubTaskStatus::Canceled,
        );
        sub.target_path = Some(
            out.path()
                .join(format!("{}.strm", name))
                .to_string_lossy()
                .to_string(),
        );
        subs.push(sub);
    }

    db.insert_sub_tasks(&task, &subs).unwrap();
    task.status = TaskStatus::Canceled;
    task.end_time = Some(now_local());
    db.save_task(&task).unwrap();

    let outcome = actions::continue_task(&db, task.id, 1).unwrap();
    assert_eq!(outcome.kept, 2);
    assert_eq!(outcome.promoted, 1);
    assert_eq!(outcome.reset, 4);

    let resumed = db.get_task(task.id).unwrap().unwrap();
    assert_eq!(resumed.status, TaskStatus::Running);
    assert!(resumed.end_time.is_none());

    let counts = db.sub_task_counts(task.id).unwrap();
    assert_eq!(counts.completed, 3);
    assert_eq!(counts.pending, 4);

    // resume the processor over the remaining pending set only
    let processor = Processor::new(Arc::clone(&db));
    processor.run_task(task.id).await.unwrap();

    let finished = db.get_task(task.id).unwrap().unwrap();
    assert_eq!(finished.status, TaskStatus::Completed);
    assert_eq!(finished.success_files, 7);
    for name in ["d", "e", "f", "g"] {
        assert!(out.path().join(format!("{}.strm", name)).exists());
    }
}

#[tokio::test]
async fn continue_rejects_non_canceled_tasks() {
    let db = common::test_db();
    let server_id = common::seed_server(&db, "http://m");
    let mut task = common::make_task(&db, server_id, "/tmp/out", 1);
    common::mark_running(&db, &mut task, now_local());

    let err = actions::continue_task(&db, task.id, 1).unwrap_err();
    assert!(matches!(err, StrmgenError::PreconditionFailed { .. }));
}

#[tokio::test]
async fn continue_resets_failed_and_retry_attempts() {
    let db = common::test_db();
    let out = tempfile::tempdir().unwrap();
    let server_id = common::seed_server(&db, "http://m");
    let mut task = common::make_task(&db, server_id, out.path().to_str().unwrap(), 1);

    let mut failed = common::make_sub_task(
        task.id,
        "/x.jpg",
        FileCategory::Image,
        ProcessKind::ResourceDownload,
        SubTaskStatus::Failed,
    );
    failed.attempts = 3;
    failed.error_message = Some("http-status 500".to_string());
    let mut retry = common::make_sub_task(
        task.id,
        "/y.jpg",
        FileCategory::Image,
        ProcessKind::ResourceDownload,
        SubTaskStatus::Retry,
    );
    retry.attempts = 2;
    retry.retry_after = Some(now_local());

    db.insert_sub_tasks(&task, &[failed, retry]).unwrap();
    task.status = TaskStatus::Canceled;
    db.save_task(&task).unwrap();

    let outcome = actions::continue_task(&db, task.id, 1).unwrap();
    assert_eq!(outcome.reset, 2);

    for path in ["/x.jpg", "/y.jpg"] {
        let sub = db.get_sub_task_by_source(task.id, path).unwrap().unwrap();
        assert_eq!(sub.status, SubTaskStatus::Pending);
        assert_eq!(sub.attempts, 0);
        assert!(sub.error_message.is_none());
        assert!(sub.retry_after.is_none());
    }
}
