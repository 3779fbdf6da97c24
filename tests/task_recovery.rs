//! Orphan-task recovery: timeout, heartbeat, activity criteria, sub-task
//! promotion and idempotence.

mod common;

use chrono::Duration;

use strmgen::parser::FileCategory;
use strmgen::processor::model::{now_local, ProcessKind, SubTaskStatus, TaskStatus};
use strmgen::processor::recovery::recover_orphaned_tasks;

#[tokio::test]
async fn timed_out_task_is_failed_with_its_sub_tasks() {
    let db = common::test_db();
    let server_id = common::seed_server(&db, "http://m");
    let mut task = common::make_task(&db, server_id, "/tmp/out", 1);

    let subs = vec![
        common::make_sub_task(task.id, "/a.mkv", FileCategory::Video, ProcessKind::StrmGeneration, SubTaskStatus::Pending),
        common::make_sub_task(task.id, "/b.jpg", FileCategory::Image, ProcessKind::ResourceDownload, SubTaskStatus::Downloading),
        common::make_sub_task(task.id, "/c.mkv", FileCategory::Video, ProcessKind::StrmGeneration, SubTaskStatus::Completed),
    ];
    db.insert_sub_tasks(&task, &subs).unwrap();

    // default timeout is 2 hours; started 3 hours ago
    common::mark_running(&db, &mut task, now_local() - Duration::hours(3));

    let report = recover_orphaned_tasks(&db).unwrap();
    assert_eq!(report.checked_tasks, 1);
    assert_eq!(report.timeout_tasks, 1);

    let failed = db.get_task(task.id).unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.end_time.is_some());

    let counts = db.sub_task_counts(task.id).unwrap();
    assert_eq!(counts.failed, 2);
    assert_eq!(counts.completed, 1);
}

#[tokio::test]
async fn heartbeat_timeout_fails_task() {
    let db = common::test_db();
    let server_id = common::seed_server(&db, "http://m");
    let mut task = common::make_task(&db, server_id, "/tmp/out", 1);

    // started recently but the heartbeat went silent 30 minutes ago
    common::mark_running(&db, &mut task, now_local() - Duration::minutes(40));
    task.last_heartbeat = Some(now_local() - Duration::minutes(30));
    db.save_task(&task).unwrap();

    let report = recover_orphaned_tasks(&db).unwrap();
    assert_eq!(report.recovered_tasks, 1);
    assert_eq!(
        db.get_task(task.id).unwrap().unwrap().status,
        TaskStatus::Failed
    );
}

#[tokio::test]
async fn stale_task_without_recent_activity_fails() {
    let db = common::test_db();
    let server_id = common::seed_server(&db, "http://m");
    let mut task = common::make_task(&db, server_id, "/tmp/out", 1);

    let mut sub = common::make_sub_task(
        task.id,
        "/a.mkv",
        FileCategory::Video,
        ProcessKind::StrmGeneration,
        SubTaskStatus::Pending,
    );
    // last sub-task write long before the recent-activity window
    sub.updated_at = now_local() - Duration::minutes(60);
    db.insert_sub_tasks(&task, &[sub]).unwrap();

    // no heartbeat column written at all (crash before the first batch)
    common::mark_running(&db, &mut task, now_local() - Duration::minutes(45));

    let report = recover_orphaned_tasks(&db).unwrap();
    assert_eq!(report.recovered_tasks, 1);
    assert_eq!(
        db.get_task(task.id).unwrap().unwrap().status,
        TaskStatus::Failed
    );
}

#[tokio::test]
async fn healthy_running_task_is_left_alone() {
    let db = common::test_db();
    let server_id = common::seed_server(&db, "http://m");
    let mut task = common::make_task(&db, server_id, "/tmp/out", 1);

    common::mark_running(&db, &mut task, now_local() - Duration::minutes(5));
    task.last_heartbeat = Some(now_local());
    db.save_task(&task).unwrap();

    let report = recover_orphaned_tasks(&db).unwrap();
    assert_eq!(report.checked_tasks, 1);
    assert_eq!(report.recovered_tasks, 0);
    assert_eq!(report.timeout_tasks, 0);
    assert_eq!(
        db.get_task(task.id).unwrap().unwrap().status,
        TaskStatus::Running
    );
}

#[tokio::test]
async fn downloading_sub_tasks_of_terminal_parents_are_promoted() {
    let db = common::test_db();
    let server_id = common::seed_server(&db, "http://m");

    // canceled parent -> its downloading child becomes canceled
    let mut canceled_parent = common::make_task(&db, server_id, "/tmp/out1", 1);
    let sub = common::make_sub_task(
        canceled_parent.id,
        "/a.jpg",
        FileCategory::Image,
        ProcessKind::ResourceDownload,
        SubTaskStatus::Downloading,
    );
    db.insert_sub_tasks(&canceled_parent, &[sub]).unwrap();
    canceled_parent.status = TaskStatus::Canceled;
    db.save_task(&canceled_parent).unwrap();

    // failed parent -> its downloading child becomes failed
    let mut failed_parent = common::make_task(&db, server_id, "/tmp/out2", 1);
    let sub = common::make_sub_task(
        failed_parent.id,
        "/b.jpg",
        FileCategory::Image,
        ProcessKind::ResourceDownload,
        SubTaskStatus::Downloading,
    );
    db.insert_sub_tasks(&failed_parent, &[sub]).unwrap();
    failed_parent.status = TaskStatus::Failed;
    db.save_task(&failed_parent).unwrap();

    let report = recover_orphaned_tasks(&db).unwrap();
    assert_eq!(report.promoted_sub_tasks, 2);

    assert_eq!(
        db.get_sub_task_by_source(canceled_parent.id, "/a.jpg").unwrap().unwrap().status,
        SubTaskStatus::Canceled
    );
    assert_eq!(
        db.get_sub_task_by_source(failed_parent.id, "/b.jpg").unwrap().unwrap().status,
        SubTaskStatus::Failed
    );
}

#[tokio::test]
async fn recovery_is_idempotent() {
    let db = common::test_db();
    let server_id = common::seed_server(&db, "http://m");
    let mut task = common::make_task(&db, server_id, "/tmp/out", 1);
    let sub = common::make_sub_task(
        task.id,
        "/a.mkv",
        FileCategory::Video,
        ProcessKind::StrmGeneration,
        SubTaskStatus::Downloading,
    );
    db.insert_sub_tasks(&task, &[sub]).unwrap();
    common::mark_running(&db, &mut task, now_local() - Duration::hours(3));

    let first = recover_orphaned_tasks(&db).unwrap();
    assert_eq!(first.timeout_tasks, 1);

    // the second pass finds nothing left to heal
    let second = recover_orphaned_tasks(&db).unwrap();
    assert_eq!(second.checked_tasks, 0);
    assert_eq!(second.timeout_tasks, 0);
    assert_eq!(second.recovered_tasks, 0);
    assert_eq!(second.promoted_sub_tasks, 0);
}
