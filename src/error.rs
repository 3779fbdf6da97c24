//! Strmgen Domain Errors
//!
//! Typed error definitions for all application domains.
//! Replaces generic `anyhow` errors with specific, actionable error types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;

/// Main application error type
#[derive(Debug)]
pub enum StrmgenError {
    // Invalid settings: overlapping extension sets, unwritable logs directory.
    // Never retried.
    Configuration { field: String, message: String },

    // Missing record, server, or task
    TaskNotFound(i64),
    SubTaskNotFound(String),
    ServerNotFound(i64),
    UploadNotFound(i64),

    // Caller is not the owner of the record/task
    PermissionDenied(String),

    // Operation invalid for the current lifecycle state
    PreconditionFailed { id: i64, expected: String, actual: String },

    // Malformed parse result or undecodable upload content
    DataCorruption(String),

    // Validation errors at the boundary
    InvalidRequest(String),

    // Database errors
    Database(String),

    // Generic
    Internal(String),
}

impl fmt::Display for StrmgenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration { field, message } => {
                write!(f, "Invalid settings ({}): {}", field, message)
            }
            Self::TaskNotFound(id) => write!(f, "Task not found: {}", id),
            Self::SubTaskNotFound(path) => write!(f, "File not found in task: {}", path),
            Self::ServerNotFound(id) => write!(f, "Media server not found: {}", id),
            Self::UploadNotFound(id) => write!(f, "Upload record not found: {}", id),
            Self::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            Self::PreconditionFailed { id, expected, actual } => {
                write!(f, "Task {} in invalid state: expected {}, got {}", id, expected, actual)
            }
            Self::DataCorruption(msg) => write!(f, "Corrupt data: {}", msg),
            Self::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            Self::Database(msg) => write!(f, "Database error: {}", msg),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for StrmgenError {}

/// HTTP error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for StrmgenError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            // 404 Not Found
            StrmgenError::TaskNotFound(_) => (StatusCode::NOT_FOUND, "TASK_NOT_FOUND", self.to_string(), None),
            StrmgenError::SubTaskNotFound(_) => (StatusCode::NOT_FOUND, "FILE_NOT_FOUND", self.to_string(), None),
            StrmgenError::ServerNotFound(_) => (StatusCode::NOT_FOUND, "SERVER_NOT_FOUND", self.to_string(), None),
            StrmgenError::UploadNotFound(_) => (StatusCode::NOT_FOUND, "UPLOAD_NOT_FOUND", self.to_string(), None),

            // 400 Bad Request
            StrmgenError::Configuration { field, .. } => {
                let details = Some(format!("field: {}", field));
                (StatusCode::BAD_REQUEST, "INVALID_SETTINGS", self.to_string(), details)
            }
            StrmgenError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST", self.to_string(), None),

            // 403 Forbidden
            StrmgenError::PermissionDenied(_) => (StatusCode::FORBIDDEN, "PERMISSION_DENIED", self.to_string(), None),

            // 409 Conflict
            StrmgenError::PreconditionFailed { .. } => (StatusCode::CONFLICT, "INVALID_STATE", self.to_string(), None),

            // 422 Unprocessable
            StrmgenError::DataCorruption(_) => (StatusCode::UNPROCESSABLE_ENTITY, "DATA_CORRUPTION", self.to_string(), None),

            // 500 Internal Server Error
            StrmgenError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DB_ERROR", self.to_string(), None),
            StrmgenError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string(), None),
        };

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

// Convenience conversions
impl From<rusqlite::Error> for StrmgenError {
    fn from(err: rusqlite::Error) -> Self {
        StrmgenError::Database(err.to_string())
    }
}

impl From<std::io::Error> for StrmgenError {
    fn from(err: std::io::Error) -> Self {
        StrmgenError::Internal(err.to_string())
    }
}

/// Result type alias for Strmgen operations
pub type StrmgenResult<T> = Result<T, StrmgenError>;
