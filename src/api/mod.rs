//! HTTP API Routes
//!
//! Boundary surface only: request parsing, ownership headers, response
//! shaping. The work happens in the processor, uploads and preview modules.

pub mod servers;
pub mod settings;
pub mod tasks;
pub mod uploads;

use axum::http::HeaderMap;

/// Caller identity comes from the auth layer in front of this service; the
/// header fallback keeps single-user deployments working without one.
pub fn user_id_from(headers: &HeaderMap) -> i64 {
    headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(1)
}
