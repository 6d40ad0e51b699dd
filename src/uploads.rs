//! Append-only ledger of upload attempts.
//!
//! Every attempt is its own row. Rows are never updated or deleted (the
//! migration installs triggers refusing both), so retry logic reads attempt
//! counts and failure reasons from here rather than from the mutable
//! `recordings.upload_info` summary.

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::debug;

use crate::error::StoreResult;
use crate::models::{NewUpload, Upload};
use crate::schema::uploads;

/// Append one attempt. Storage failures propagate to the caller.
pub fn record_attempt(conn: &mut SqliteConnection, attempt: &NewUpload) -> StoreResult<Upload> {
    let row = diesel::insert_into(uploads::table)
        .values(attempt)
        .returning(Upload::as_returning())
        .get_result(conn)?;

    debug!(
        "Upload attempt #{} for recording {} to {}: success={}",
        row.id, row.recording_id, row.remote_slug, row.success
    );
    Ok(row)
}

/// All attempts for a recording, oldest first.
pub fn attempts_for(conn: &mut SqliteConnection, recording_id: i64) -> StoreResult<Vec<Upload>> {
    Ok(uploads::table
        .filter(uploads::recording_id.eq(recording_id))
        .order((uploads::attempt_at.asc(), uploads::id.asc()))
        .select(Upload::as_select())
        .load(conn)?)
}

pub fn attempt_count(conn: &mut SqliteConnection, recording_id: i64, remote_slug: &str) -> StoreResult<i64> {
    Ok(uploads::table
        .filter(uploads::recording_id.eq(recording_id))
        .filter(uploads::remote_slug.eq(remote_slug))
        .count()
        .get_result(conn)?)
}

/// Most recent failed attempt against `remote_slug`, if any.
pub fn last_failure(
    conn: &mut SqliteConnection,
    recording_id: i64,
    remote_slug: &str,
) -> StoreResult<Option<Upload>> {
    Ok(uploads::table
        .filter(uploads::recording_id.eq(recording_id))
        .filter(uploads::remote_slug.eq(remote_slug))
        .filter(uploads::success.eq(false))
        .order((uploads::attempt_at.desc(), uploads::id.desc()))
        .select(Upload::as_select())
        .first(conn)
        .optional()?)
}
