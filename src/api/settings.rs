//! Settings API Routes
//!
//! The single settings row: read, validated update, version bumping and
//! live re-application of the logging fields.

use axum::{
    extract::State,
    http::HeaderMap,
    routing::{get, put},
    Json, Router,
};
use std::sync::Arc;

use crate::error::StrmgenResult;
use crate::settings::{logging, Settings};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_settings))
        .route("/", put(update_settings))
}

/// GET /api/settings
async fn get_settings(State(state): State<Arc<AppState>>) -> StrmgenResult<Json<Settings>> {
    Ok(Json(state.db.get_settings()?))
}

/// PUT /api/settings - validate, persist, re-apply logging fields
async fn update_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut proposal): Json<Settings>,
) -> StrmgenResult<Json<Settings>> {
    let user_id = super::user_id_from(&headers);
    proposal.validate()?;
    proposal.updated_by = Some(user_id);

    let current = state.db.get_settings()?;
    let updated = current.apply_update(proposal);
    state.db.save_settings(&updated)?;

    if updated.settings_version != current.settings_version {
        tracing::info!(
            "File-type lists changed, settings version bumped to {}",
            updated.settings_version
        );
    }

    // Log level / SQL echo apply process-wide without a restart
    if updated.log_level != current.log_level
        || updated.enable_sql_logging != current.enable_sql_logging
    {
        logging::apply_settings(&updated);
    }

    Ok(Json(updated))
}
