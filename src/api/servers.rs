//! Media Server API Routes
//!
//! CRUD over the media/download server table plus a reachability probe.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::db::{MediaServer, ServerKind, ServerStatus};
use crate::error::{StrmgenError, StrmgenResult};
use crate::processor::model::now_local;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_servers).post(create_server))
        .route("/:id", put(update_server).delete(delete_server))
        .route("/:id/test", post(test_server))
}

#[derive(Deserialize)]
struct ServerRequest {
    name: String,
    server_kind: ServerKind,
    base_url: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    auth_required: bool,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Serialize)]
struct TestResponse {
    status: ServerStatus,
    message: String,
}

fn validate_base_url(base_url: &str, kind: ServerKind) -> StrmgenResult<()> {
    let needs_scheme = matches!(
        kind,
        ServerKind::Http | ServerKind::Https | ServerKind::Cd2host | ServerKind::Xiaoyahost
    );
    if needs_scheme && !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return Err(StrmgenError::InvalidRequest(format!(
            "base URL '{}' must start with http:// or https://",
            base_url
        )));
    }
    Ok(())
}

/// GET /api/servers
async fn list_servers(State(state): State<Arc<AppState>>) -> StrmgenResult<Json<Vec<MediaServer>>> {
    Ok(Json(state.db.list_servers()?))
}

/// POST /api/servers
async fn create_server(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<ServerRequest>,
) -> StrmgenResult<Json<MediaServer>> {
    let user_id = super::user_id_from(&headers);
    validate_base_url(&payload.base_url, payload.server_kind)?;

    let mut server = MediaServer {
        id: 0,
        name: payload.name,
        server_kind: payload.server_kind,
        base_url: payload.base_url.trim_end_matches('/').to_string(),
        description: payload.description,
        auth_required: payload.auth_required,
        username: payload.username,
        password: payload.password,
        status: ServerStatus::Unknown,
        created_by: user_id,
        created_at: now_local(),
    };
    server.id = state.db.insert_server(&server)?;
    Ok(Json(server))
}

/// PUT /api/servers/:id
async fn update_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<ServerRequest>,
) -> StrmgenResult<Json<MediaServer>> {
    validate_base_url(&payload.base_url, payload.server_kind)?;

    let mut server = state
        .db
        .get_server(id)?
        .ok_or(StrmgenError::ServerNotFound(id))?;
    server.name = payload.name;
    server.server_kind = payload.server_kind;
    server.base_url = payload.base_url.trim_end_matches('/').to_string();
    server.description = payload.description;
    server.auth_required = payload.auth_required;
    server.username = payload.username;
    if payload.password.is_some() {
        server.password = payload.password;
    }
    state.db.update_server(&server)?;
    Ok(Json(server))
}

/// DELETE /api/servers/:id
async fn delete_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> StrmgenResult<StatusCode> {
    state
        .db
        .get_server(id)?
        .ok_or(StrmgenError::ServerNotFound(id))?;
    state.db.delete_server(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/servers/:id/test - probe reachability and record the outcome
async fn test_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> StrmgenResult<Json<TestResponse>> {
    let server = state
        .db
        .get_server(id)?
        .ok_or(StrmgenError::ServerNotFound(id))?;

    let (status, message) = probe(&server).await;
    state.db.set_server_status(id, status)?;
    Ok(Json(TestResponse { status, message }))
}

/// Only http-family servers are actively probed; other kinds are recorded
/// as untested.
async fn probe(server: &MediaServer) -> (ServerStatus, String) {
    match server.server_kind {
        ServerKind::Http | ServerKind::Https | ServerKind::Cd2host | ServerKind::Xiaoyahost => {}
        other => {
            return (
                ServerStatus::Warning,
                format!("{} servers are not probed", other.as_str()),
            );
        }
    }

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(e) => return (ServerStatus::Error, e.to_string()),
    };

    let mut request = client.get(&server.base_url);
    if server.auth_required {
        if let Some(username) = &server.username {
            request = request.basic_auth(username, server.password.as_deref());
        }
    }

    match request.send().await {
        Ok(response) if response.status().is_success() => (
            ServerStatus::Success,
            format!("reachable ({})", response.status()),
        ),
        Ok(response) => (
            ServerStatus::Warning,
            format!("reachable but returned {}", response.status()),
        ),
        Err(e) => (ServerStatus::Error, format!("unreachable: {}", e)),
    }
}
