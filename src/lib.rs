//! strmgen — STRM library generator for cloud-drive directory-tree exports.
//!
//! Parses an uploaded index file into a typed file list, then materialises
//! each file into a local library: STRM stubs for videos, downloaded copies
//! for sidecar assets. The task execution subsystem (worker pool, retry and
//! recovery services) lives under [`processor`].

use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod parser;
pub mod preview;
pub mod processor;
pub mod settings;
pub mod uploads;

pub struct AppState {
    pub db: Arc<db::Db>,
    pub config: config::Config,
    pub processor: Arc<processor::Processor>,
    pub retry_service: Arc<processor::RetryService>,
    pub recovery_service: Arc<processor::RecoveryService>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Assemble the application router over a shared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/health", get(health))
        .nest("/api/uploads", api::uploads::router())
        .nest("/api/tasks", api::tasks::router())
        .nest("/api/settings", api::settings::router())
        .nest("/api/servers", api::servers::router())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
