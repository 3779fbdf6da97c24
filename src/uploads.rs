//! Upload Records
//!
//! Intake and parsing of directory-tree index files. The blob lives inline
//! in the record; parsing caches a typed ParseResult JSON document that is
//! re-typed at read time whenever the settings version has moved on.

use std::sync::Arc;

use crate::db::{Db, UploadRecord, UploadStatus};
use crate::error::{StrmgenError, StrmgenResult};
use crate::parser::{FileTypeSets, ParseResult, TreeParser};
use crate::processor::model::now_local;

const MAX_UPLOAD_BYTES: i64 = 10 * 1024 * 1024;

/// Store an uploaded index file. Only `.txt` exports up to 10 MiB are
/// accepted.
pub fn handle_upload(
    db: &Db,
    filename: &str,
    content: Vec<u8>,
    uploader: i64,
) -> StrmgenResult<UploadRecord> {
    if !filename.ends_with(".txt") {
        return Err(StrmgenError::InvalidRequest(
            "invalid file type, only .txt index exports are supported".to_string(),
        ));
    }
    if content.len() as i64 > MAX_UPLOAD_BYTES {
        return Err(StrmgenError::InvalidRequest(
            "file too large, the limit is 10 MiB".to_string(),
        ));
    }

    let mut record = UploadRecord {
        id: 0,
        filename: filename.to_string(),
        filesize: content.len() as i64,
        content,
        status: UploadStatus::Uploaded,
        parsed_result: None,
        parse_time: None,
        file_path: None,
        uploader,
        created_at: now_local(),
    };
    record.id = db.insert_upload(&record)?;
    Ok(record)
}

/// Parse an uploaded record and cache the result on the row.
///
/// uploaded|failed -> parsing -> parsed|failed. Re-parsing a successfully
/// parsed record is rejected.
pub fn parse_upload(db: &Db, record_id: i64, user_id: i64) -> StrmgenResult<ParseResult> {
    let record = get_owned_record(db, record_id, user_id)?;

    if !matches!(record.status, UploadStatus::Uploaded | UploadStatus::Failed) {
        return Err(StrmgenError::PreconditionFailed {
            id: record_id,
            expected: "uploaded or failed".to_string(),
            actual: record.status.as_str().to_string(),
        });
    }

    let content = record_content(&record)?;

    db.update_upload_status(record_id, UploadStatus::Parsing)?;

    let settings = db.get_settings()?;
    let sets = FileTypeSets::from_settings(&settings);
    let parser = TreeParser::new(sets);

    match parser.parse(&content, &record.filename) {
        Ok(result) => {
            let json = serde_json::to_string(&result)
                .map_err(|e| StrmgenError::Internal(e.to_string()))?;
            db.save_parse_result(record_id, &json, now_local())?;
            Ok(result)
        }
        Err(e) => {
            db.update_upload_status(record_id, UploadStatus::Failed)?;
            Err(StrmgenError::DataCorruption(e.to_string()))
        }
    }
}

/// Load the cached parse result of a record, re-typing it first when its
/// version stamp no longer matches the current settings version. The
/// refreshed result is written back before it is returned.
pub fn load_parse_result(db: &Arc<Db>, record_id: i64) -> StrmgenResult<ParseResult> {
    let record = db
        .get_upload(record_id)?
        .ok_or(StrmgenError::UploadNotFound(record_id))?;

    if record.status != UploadStatus::Parsed {
        return Err(StrmgenError::PreconditionFailed {
            id: record_id,
            expected: "parsed".to_string(),
            actual: record.status.as_str().to_string(),
        });
    }

    let json = record.parsed_result.ok_or_else(|| {
        StrmgenError::DataCorruption(format!("record {} has no cached parse result", record_id))
    })?;
    let mut result: ParseResult = serde_json::from_str(&json)
        .map_err(|e| StrmgenError::DataCorruption(format!("cached parse result: {}", e)))?;

    let settings = db.get_settings()?;
    if result.settings_version != settings.settings_version {
        let sets = FileTypeSets::from_settings(&settings);
        let changed = result.refresh_types(&sets);
        let updated_json = serde_json::to_string(&result)
            .map_err(|e| StrmgenError::Internal(e.to_string()))?;
        db.update_parse_result(record_id, &updated_json)?;
        if changed {
            tracing::info!(
                "Re-typed cached parse result of record {} to settings version {}",
                record_id,
                settings.settings_version
            );
        }
    }

    Ok(result)
}

/// Fetch a record, enforcing ownership
pub fn get_owned_record(db: &Db, record_id: i64, user_id: i64) -> StrmgenResult<UploadRecord> {
    let record = db
        .get_upload(record_id)?
        .ok_or(StrmgenError::UploadNotFound(record_id))?;
    if record.uploader != user_id {
        return Err(StrmgenError::PermissionDenied(format!(
            "record {} belongs to another user",
            record_id
        )));
    }
    Ok(record)
}

/// The blob normally lives inline; old rows may only carry an on-disk path.
fn record_content(record: &UploadRecord) -> StrmgenResult<Vec<u8>> {
    if !record.content.is_empty() {
        return Ok(record.content.clone());
    }
    if let Some(path) = &record.file_path {
        return std::fs::read(path)
            .map_err(|e| StrmgenError::DataCorruption(format!("legacy upload file unreadable: {}", e)));
    }
    Err(StrmgenError::DataCorruption(format!(
        "record {} has no stored content",
        record.id
    )))
}

pub fn delete_upload(db: &Db, record_id: i64, user_id: i64) -> StrmgenResult<()> {
    let record = get_owned_record(db, record_id, user_id)?;

    // Old rows may still have an on-disk copy
    if let Some(path) = &record.file_path {
        if std::path::Path::new(path).exists() {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!("Failed to remove legacy upload file {}: {}", path, e);
            }
        }
    }

    db.delete_upload(record_id)?;
    Ok(())
}
