//! Upload API Routes
//!
//! Index-file intake, parsing and parse-result retrieval.

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{StrmgenError, StrmgenResult};
use crate::parser::{filter_files, FileCategory, ParsedEntry};
use crate::uploads;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(upload_index).get(list_uploads))
        .route("/:id/parse", post(parse_index))
        .route("/:id/result", get(get_parse_result))
        .route("/:id/download", get(download_index))
        .route("/:id", delete(delete_upload))
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize)]
struct UploadResponse {
    id: i64,
    filename: String,
    filesize: i64,
    status: String,
}

#[derive(Serialize)]
struct ParseResponse {
    id: i64,
    file_name: String,
    total_files: usize,
    stats: crate::parser::TypeStats,
    settings_version: i64,
}

#[derive(Serialize)]
struct ParseResultResponse {
    file_name: String,
    total_files: usize,
    stats: crate::parser::TypeStats,
    settings_version: i64,
    parsed_files: Vec<ParsedEntry>,
    total: usize,
    page: u32,
    page_size: u32,
}

#[derive(Serialize)]
struct UploadListResponse {
    uploads: Vec<UploadResponse>,
    total: u64,
    page: u32,
    page_size: u32,
}

// ============================================================================
// Request Types
// ============================================================================

#[derive(Deserialize)]
struct ListQuery {
    page: Option<u32>,
    page_size: Option<u32>,
}

#[derive(Deserialize)]
struct ParseResultQuery {
    file_type: Option<String>,
    keyword: Option<String>,
    page: Option<u32>,
    page_size: Option<u32>,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/uploads - store an index export
async fn upload_index(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> StrmgenResult<Json<UploadResponse>> {
    let user_id = super::user_id_from(&headers);

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| StrmgenError::InvalidRequest(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(|name| name.to_string())
            .ok_or_else(|| StrmgenError::InvalidRequest("missing file name".to_string()))?;
        let content = field
            .bytes()
            .await
            .map_err(|e| StrmgenError::InvalidRequest(e.to_string()))?
            .to_vec();

        let record = uploads::handle_upload(&state.db, &filename, content, user_id)?;
        return Ok(Json(UploadResponse {
            id: record.id,
            filename: record.filename,
            filesize: record.filesize,
            status: record.status.as_str().to_string(),
        }));
    }

    Err(StrmgenError::InvalidRequest(
        "multipart field 'file' is required".to_string(),
    ))
}

/// GET /api/uploads - list the caller's upload records
async fn list_uploads(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> StrmgenResult<Json<UploadListResponse>> {
    let user_id = super::user_id_from(&headers);
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(10).clamp(1, 100);

    let (records, total) = state.db.list_uploads(user_id, page, page_size)?;
    Ok(Json(UploadListResponse {
        uploads: records
            .into_iter()
            .map(|record| UploadResponse {
                id: record.id,
                filename: record.filename,
                filesize: record.filesize,
                status: record.status.as_str().to_string(),
            })
            .collect(),
        total,
        page,
        page_size,
    }))
}

/// POST /api/uploads/:id/parse - parse the stored blob
async fn parse_index(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> StrmgenResult<Json<ParseResponse>> {
    let user_id = super::user_id_from(&headers);
    let result = uploads::parse_upload(&state.db, id, user_id)?;
    // The full file list stays in the row; the client gets the counts
    Ok(Json(ParseResponse {
        id,
        file_name: result.file_name,
        total_files: result.total_files,
        stats: result.stats,
        settings_version: result.settings_version,
    }))
}

/// GET /api/uploads/:id/result - cached parse result, filtered and paginated
async fn get_parse_result(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<ParseResultQuery>,
) -> StrmgenResult<Json<ParseResultResponse>> {
    let user_id = super::user_id_from(&headers);
    uploads::get_owned_record(&state.db, id, user_id)?;

    let result = uploads::load_parse_result(&state.db, id)?;

    let file_type = query
        .file_type
        .as_deref()
        .filter(|t| *t != "all")
        .map(FileCategory::from_str);
    let filtered = filter_files(
        &result.parsed_files,
        file_type,
        query.keyword.as_deref(),
        None,
    );

    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(10).clamp(1, 10_000);
    let total = filtered.len();
    let start = ((page - 1) * page_size) as usize;
    let parsed_files: Vec<ParsedEntry> = filtered
        .into_iter()
        .skip(start)
        .take(page_size as usize)
        .cloned()
        .collect();

    Ok(Json(ParseResultResponse {
        file_name: result.file_name,
        total_files: result.total_files,
        stats: result.stats,
        settings_version: result.settings_version,
        parsed_files,
        total,
        page,
        page_size,
    }))
}

/// GET /api/uploads/:id/download - original blob back
async fn download_index(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> StrmgenResult<impl IntoResponse> {
    let user_id = super::user_id_from(&headers);
    let record = uploads::get_owned_record(&state.db, id, user_id)?;

    let disposition = format!("attachment; filename=\"{}\"", record.filename);
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        record.content,
    ))
}

/// DELETE /api/uploads/:id
async fn delete_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> StrmgenResult<StatusCode> {
    let user_id = super::user_id_from(&headers);
    uploads::delete_upload(&state.db, id, user_id)?;
    Ok(StatusCode::NO_CONTENT)
}
