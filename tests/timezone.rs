//! Stored datetimes are naive local time everywhere; aware values get
//! normalised at the boundary and heartbeats never go backwards.

mod common;

use chrono::{Duration, TimeZone, Utc};

use strmgen::processor::model::{normalize_datetime, now_local};

#[tokio::test]
async fn heartbeats_are_monotonic_across_stale_writers() {
    let db = common::test_db();
    let server_id = common::seed_server(&db, "http://m");
    let task = common::make_task(&db, server_id, "/tmp/out", 1);

    let base = now_local();
    db.touch_task_heartbeat(task.id, base).unwrap();
    db.touch_task_heartbeat(task.id, base + Duration::seconds(10)).unwrap();
    // a stale writer loses
    db.touch_task_heartbeat(task.id, base - Duration::seconds(30)).unwrap();

    let stored = db.get_task(task.id).unwrap().unwrap().last_heartbeat.unwrap();
    assert_eq!(stored, base + Duration::seconds(10));
}

#[test]
fn aware_values_are_converted_to_local_then_stripped() {
    let aware = Utc.with_ymd_and_hms(2025, 7, 10, 12, 0, 0).unwrap();
    let naive = normalize_datetime(aware);
    // round-tripping through the local zone keeps the instant
    let expected = aware.with_timezone(&chrono::Local).naive_local();
    assert_eq!(naive, expected);
}

#[test]
fn normalized_values_compare_without_mixing_zones() {
    let aware_now = Utc::now();
    let local_now = now_local();
    let delta = local_now - normalize_datetime(aware_now);
    // both sides observe the same local instant (allow scheduler slack)
    assert!(delta.num_seconds().abs() < 5);
}

#[tokio::test]
async fn datetime_storage_roundtrip_preserves_subsecond_precision() {
    let db = common::test_db();
    let server_id = common::seed_server(&db, "http://m");
    let mut task = common::make_task(&db, server_id, "/tmp/out", 1);

    let instant = now_local();
    task.start_time = Some(instant);
    db.save_task(&task).unwrap();

    let loaded = db.get_task(task.id).unwrap().unwrap().start_time.unwrap();
    // storage keeps millisecond precision
    let diff = (instant - loaded).num_milliseconds().abs();
    assert!(diff <= 1);
}
