//! Progress accounting: counter projections and percent semantics over the
//! sub-task table.

mod common;

use strmgen::parser::FileCategory;
use strmgen::processor::model::{ProcessKind, SubTaskStatus};
use strmgen::processor::progress::{progress_line, progress_percent};

#[tokio::test]
async fn counts_project_processed_and_split_by_kind() {
    let db = common::test_db();
    let server_id = common::seed_server(&db, "http://m");
    let task = common::make_task(&db, server_id, "/tmp/out", 1);

    let subs = vec![
        common::make_sub_task(task.id, "/a.mkv", FileCategory::Video, ProcessKind::StrmGeneration, SubTaskStatus::Completed),
        common::make_sub_task(task.id, "/b.mkv", FileCategory::Video, ProcessKind::StrmGeneration, SubTaskStatus::Failed),
        common::make_sub_task(task.id, "/c.jpg", FileCategory::Image, ProcessKind::ResourceDownload, SubTaskStatus::Completed),
        common::make_sub_task(task.id, "/d.jpg", FileCategory::Image, ProcessKind::ResourceDownload, SubTaskStatus::Pending),
        common::make_sub_task(task.id, "/e.srt", FileCategory::Subtitle, ProcessKind::ResourceDownload, SubTaskStatus::Retry),
        common::make_sub_task(task.id, "/f.nfo", FileCategory::Metadata, ProcessKind::ResourceDownload, SubTaskStatus::Downloading),
    ];
    db.insert_sub_tasks(&task, &subs).unwrap();

    let counts = db.sub_task_counts(task.id).unwrap();
    assert_eq!(counts.total, 6);
    // processed counts terminal successes and failures only
    assert_eq!(counts.processed(), 3);
    assert_eq!(counts.open(), 3);
    assert_eq!(counts.strm_completed, 1);
    assert_eq!(counts.strm_failed, 1);
    assert_eq!(counts.resource_completed, 1);
    assert_eq!(counts.resource_failed, 0);

    assert_eq!(progress_percent(counts.processed(), counts.total), 50);
}

#[tokio::test]
async fn all_failed_sub_tasks_yield_consistent_counters() {
    let db = common::test_db();
    let server_id = common::seed_server(&db, "http://m");
    let task = common::make_task(&db, server_id, "/tmp/out", 1);

    let subs: Vec<_> = (0..4)
        .map(|i| {
            common::make_sub_task(
                task.id,
                &format!("/f{}.jpg", i),
                FileCategory::Image,
                ProcessKind::ResourceDownload,
                SubTaskStatus::Failed,
            )
        })
        .collect();
    db.insert_sub_tasks(&task, &subs).unwrap();

    let counts = db.sub_task_counts(task.id).unwrap();
    assert_eq!(counts.failed, 4);
    assert_eq!(counts.processed(), 4);
    assert_eq!(counts.open(), 0);
    assert_eq!(progress_percent(counts.processed(), counts.total), 100);
}

#[test]
fn percent_is_bounded_and_safe() {
    assert_eq!(progress_percent(0, 0), 0);
    assert_eq!(progress_percent(7, 0), 0);
    assert_eq!(progress_percent(200, 100), 100);
    assert_eq!(progress_percent(1, 3), 33);
}

#[test]
fn progress_line_renders_bar_and_counts() {
    let line = progress_line(25, 100, "resource download (batch 2)");
    assert!(line.contains("25%"));
    assert!(line.contains("(25/100)"));
    assert!(line.contains("resource download (batch 2)"));

    let full = progress_line(100, 100, "");
    assert!(full.contains("[####################]"));
}
