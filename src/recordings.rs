//! Recording lifecycle: captured, analyzed, uploaded, locally deleted.
//!
//! File references are fixed at capture. After that only the status flags
//! and the two JSON state maps change, and every such write goes through
//! [`save_state`], a compare-and-swap on the `version` column. Workers that
//! lose the race re-read the row and apply their change again.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::{debug, info, warn};

use crate::detections;
use crate::error::{StoreError, StoreResult};
use crate::models::{AnalysisEntry, AnalysisStatus, NewDetection, NewRecording, NewUpload, Recording, UploadInfo};
use crate::remotes;
use crate::schema::recordings;
use crate::uploads;

/// How many times a versioned update re-reads and retries before giving up
/// with [`StoreError::Conflict`].
pub const MAX_CONFLICT_RETRIES: usize = 5;

/// When a recording counts as safely copied off the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadPolicy {
    /// The first successful upload to any remote.
    #[default]
    AnyRemote,
    /// A successful upload to every active remote.
    AllActiveRemotes,
}

impl UploadPolicy {
    fn is_satisfied(&self, info: &UploadInfo, active: &[String]) -> bool {
        match self {
            UploadPolicy::AnyRemote => info.any_success(),
            UploadPolicy::AllActiveRemotes => {
                info.any_success() && active.iter().all(|slug| info.has_success(slug))
            }
        }
    }
}

impl FromStr for UploadPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Ok(UploadPolicy::AnyRemote),
            "all" => Ok(UploadPolicy::AllActiveRemotes),
            other => Err(format!("expected any or all, got {other}")),
        }
    }
}

impl fmt::Display for UploadPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UploadPolicy::AnyRemote => "any",
            UploadPolicy::AllActiveRemotes => "all",
        })
    }
}

/// Whether the retention worker may drop raw files that never left the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetentionPolicy {
    #[default]
    RequireUpload,
    /// Explicit override, e.g. for a node without any remote configured.
    AllowUnuploaded,
}

impl FromStr for RetentionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "require-upload" => Ok(RetentionPolicy::RequireUpload),
            "allow-unuploaded" => Ok(RetentionPolicy::AllowUnuploaded),
            other => Err(format!("expected require-upload or allow-unuploaded, got {other}")),
        }
    }
}

/// Store a finished capture with empty state maps.
pub fn create(conn: &mut SqliteConnection, recording: &NewRecording) -> StoreResult<Recording> {
    let row = diesel::insert_into(recordings::table)
        .values(recording)
        .returning(Recording::as_returning())
        .get_result(conn)?;

    info!(
        "Recording {} captured by {} at {} ({})",
        row.id, row.sensor_id, row.time, row.file_raw
    );
    Ok(row)
}

pub fn get(conn: &mut SqliteConnection, id: i64) -> StoreResult<Recording> {
    recordings::table
        .find(id)
        .select(Recording::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| StoreError::not_found("recording", id))
}

/// Recordings captured in `[from, to)`, oldest first.
pub fn in_time_range(
    conn: &mut SqliteConnection,
    from: NaiveDateTime,
    to: NaiveDateTime,
) -> StoreResult<Vec<Recording>> {
    Ok(recordings::table
        .filter(recordings::time.ge(from))
        .filter(recordings::time.lt(to))
        .order((recordings::time.asc(), recordings::id.asc()))
        .select(Recording::as_select())
        .load(conn)?)
}

/// Oldest recordings still waiting for a successful upload.
pub fn pending_upload(conn: &mut SqliteConnection, limit: i64) -> StoreResult<Vec<Recording>> {
    Ok(recordings::table
        .filter(recordings::uploaded.eq(false))
        .filter(recordings::local_deleted.eq(false))
        .order((recordings::time.asc(), recordings::id.asc()))
        .limit(limit)
        .select(Recording::as_select())
        .load(conn)?)
}

/// Oldest uploaded recordings whose local files are still present.
pub fn deletable(conn: &mut SqliteConnection, limit: i64) -> StoreResult<Vec<Recording>> {
    Ok(recordings::table
        .filter(recordings::uploaded.eq(true))
        .filter(recordings::local_deleted.eq(false))
        .order((recordings::time.asc(), recordings::id.asc()))
        .limit(limit)
        .select(Recording::as_select())
        .load(conn)?)
}

/// Write the mutable columns of `recording` back, provided the stored row is
/// still at `recording.version`. Returns the row with its new version, or
/// [`StoreError::Conflict`] if another writer got there first.
pub fn save_state(conn: &mut SqliteConnection, recording: &Recording) -> StoreResult<Recording> {
    let saved = diesel::update(
        recordings::table
            .filter(recordings::id.eq(recording.id))
            .filter(recordings::version.eq(recording.version)),
    )
    .set((
        recordings::analysis_state.eq(&recording.analysis_state),
        recordings::upload_info.eq(&recording.upload_info),
        recordings::uploaded.eq(recording.uploaded),
        recordings::uploaded_at.eq(recording.uploaded_at),
        recordings::local_deleted.eq(recording.local_deleted),
        recordings::version.eq(recording.version + 1),
    ))
    .returning(Recording::as_returning())
    .get_result(conn)
    .optional()?;

    saved.ok_or(StoreError::Conflict(recording.id))
}

/// Read, mutate and save a recording, retrying on version conflicts.
///
/// `mutate` may run more than once and must derive its change from the row
/// it is handed. Returning an error from it aborts without writing.
pub fn update_versioned<F>(conn: &mut SqliteConnection, id: i64, mut mutate: F) -> StoreResult<Recording>
where
    F: FnMut(&mut Recording) -> StoreResult<()>,
{
    for attempt in 1..=MAX_CONFLICT_RETRIES {
        let mut recording = get(conn, id)?;
        mutate(&mut recording)?;

        match save_state(conn, &recording) {
            Err(StoreError::Conflict(_)) => {
                debug!("Recording {} changed underneath us (attempt {}), retrying", id, attempt);
            }
            other => return other,
        }
    }

    warn!("Giving up on recording {} after {} conflicting updates", id, MAX_CONFLICT_RETRIES);
    Err(StoreError::Conflict(id))
}

/// Set `analysis_state[worker]`. Other workers' entries are left alone.
pub fn set_analysis_status(
    conn: &mut SqliteConnection,
    id: i64,
    worker: &str,
    status: AnalysisStatus,
    error: Option<&str>,
) -> StoreResult<Recording> {
    update_versioned(conn, id, |recording| {
        recording.analysis_state.set(
            worker,
            AnalysisEntry {
                status,
                updated_at: Utc::now().naive_utc(),
                error: error.map(str::to_string),
            },
        );
        Ok(())
    })
}

/// Store a worker's detections and mark its analysis done, atomically.
pub fn complete_analysis(
    conn: &mut SqliteConnection,
    id: i64,
    worker: &str,
    results: &[NewDetection],
) -> StoreResult<Recording> {
    conn.immediate_transaction::<_, StoreError, _>(|conn| {
        let stored = detections::record_detections(conn, results)?;
        let recording = set_analysis_status(conn, id, worker, AnalysisStatus::Done, None)?;
        info!("Analysis {} of recording {} done with {} detection(s)", worker, id, stored);
        Ok(recording)
    })
}

/// Append an upload attempt to the ledger and fold it into `upload_info`.
///
/// `uploaded` flips to true once `policy` is satisfied and never flips back.
/// Ledger row and summary are committed together.
pub fn apply_upload_attempt(
    conn: &mut SqliteConnection,
    attempt: &NewUpload,
    policy: UploadPolicy,
) -> StoreResult<Recording> {
    conn.immediate_transaction::<_, StoreError, _>(|conn| {
        let row = uploads::record_attempt(conn, attempt)?;

        let active: Vec<String> = match policy {
            UploadPolicy::AnyRemote => Vec::new(),
            UploadPolicy::AllActiveRemotes => remotes::active_remotes(conn)?
                .into_iter()
                .map(|remote| remote.slug)
                .collect(),
        };

        let mut flipped = false;
        let recording = update_versioned(conn, attempt.recording_id, |recording| {
            recording.upload_info.record(&row);
            flipped = !recording.uploaded && policy.is_satisfied(&recording.upload_info, &active);
            if flipped {
                recording.uploaded = true;
                recording.uploaded_at = Some(Utc::now().naive_utc());
            }
            Ok(())
        })?;

        if flipped {
            info!("Recording {} uploaded ({} policy, via {})", row.recording_id, policy, row.remote_slug);
        } else if !row.success {
            warn!(
                "Upload of recording {} to {} failed: {}",
                row.recording_id,
                row.remote_slug,
                row.error_message.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(recording)
    })
}

/// Mark the raw files as removed from the node. One-way and idempotent.
///
/// Refused with [`StoreError::NotUploaded`] while the recording has not been
/// uploaded, unless `retention` is the explicit override.
pub fn mark_local_deleted(
    conn: &mut SqliteConnection,
    id: i64,
    retention: RetentionPolicy,
) -> StoreResult<Recording> {
    let current = get(conn, id)?;
    if current.local_deleted {
        return Ok(current);
    }

    let recording = update_versioned(conn, id, |recording| {
        if !recording.uploaded && retention == RetentionPolicy::RequireUpload {
            return Err(StoreError::NotUploaded(id));
        }
        recording.local_deleted = true;
        Ok(())
    })?;

    if recording.uploaded {
        info!("Recording {} deleted locally", id);
    } else {
        warn!("Recording {} deleted locally without a successful upload", id);
    }
    Ok(recording)
}
