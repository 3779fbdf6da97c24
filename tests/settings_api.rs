//! Settings endpoint behaviour through the router: read, update with
//! validation, version bumping.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tower::util::ServiceExt;

use strmgen::processor::{Processor, RecoveryService, RetryService};
use strmgen::settings::Settings;
use strmgen::{build_router, config::Config, AppState};

fn app() -> (axum::Router, Arc<strmgen::db::Db>) {
    let db = common::test_db();
    let processor = Arc::new(Processor::new(Arc::clone(&db)));
    let state = Arc::new(AppState {
        db: Arc::clone(&db),
        config: Config::default(),
        processor: Arc::clone(&processor),
        retry_service: RetryService::new(processor),
        recovery_service: RecoveryService::new(Arc::clone(&db)),
    });
    (build_router(state), db)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn get_settings_returns_defaults() {
    let (app, _db) = app();

    let response = app
        .oneshot(Request::builder().uri("/api/settings").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["settings_version"], 1);
    assert_eq!(json["download_workers"], 1);
    assert_eq!(json["failure_retry_count"], 3);
}

#[tokio::test]
async fn update_bumps_version_only_on_file_type_change() {
    let (app, db) = app();

    // worker change: no bump
    let mut proposal = db.get_settings().unwrap();
    proposal.download_workers = 4;
    let response = put_settings(app.clone(), &proposal).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["settings_version"], 1);

    // file-type change: bump
    let mut proposal = db.get_settings().unwrap();
    proposal.video_file_types = "mkv,mp4,webm".to_string();
    let response = put_settings(app, &proposal).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["settings_version"], 2);

    assert_eq!(db.get_settings().unwrap().settings_version, 2);
    assert_eq!(db.get_settings().unwrap().download_workers, 4);
}

#[tokio::test]
async fn update_rejects_overlapping_extension_sets() {
    let (app, db) = app();

    let mut proposal = db.get_settings().unwrap();
    proposal.audio_file_types = "mp3,mkv".to_string(); // mkv is a video type

    let response = put_settings(app, &proposal).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = body_json(response).await;
    assert_eq!(json["code"], "INVALID_SETTINGS");
    // nothing was persisted
    assert_eq!(db.get_settings().unwrap().audio_file_types, Settings::default().audio_file_types);
}

async fn put_settings(app: axum::Router, settings: &Settings) -> axum::response::Response {
    app.oneshot(
        Request::builder()
            .method("PUT")
            .uri("/api/settings")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(settings).unwrap()))
            .unwrap(),
    )
    .await
    .unwrap()
}
