//! Analysis results and the label taxonomy used to present them.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::Serialize;

use crate::error::{StoreError, StoreResult};
use crate::models::{Detection, NewDetection, Taxonomy};
use crate::schema::{detections, taxonomy};

/// Optional narrowing of a time-range query.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectionFilter<'a> {
    pub worker: Option<&'a str>,
    pub label: Option<&'a str>,
    pub min_confidence: Option<f64>,
}

/// A detection with its taxonomy entry, when one exists, and the name to
/// show for the requested locale.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichedDetection {
    #[serde(flatten)]
    pub detection: Detection,
    pub taxonomy: Option<Taxonomy>,
    pub display_name: String,
}

/// Store one worker's results. Detections are write-once.
pub fn record_detections(conn: &mut SqliteConnection, results: &[NewDetection]) -> StoreResult<usize> {
    conn.transaction::<_, StoreError, _>(|conn| {
        let mut stored = 0;
        for result in results {
            stored += diesel::insert_into(detections::table)
                .values(result)
                .execute(conn)?;
        }
        Ok(stored)
    })
}

/// Detections starting in `[from, to)`, in time order.
pub fn detections_in_range(
    conn: &mut SqliteConnection,
    from: NaiveDateTime,
    to: NaiveDateTime,
    filter: DetectionFilter<'_>,
) -> StoreResult<Vec<Detection>> {
    let mut query = detections::table
        .filter(detections::time.ge(from))
        .filter(detections::time.lt(to))
        .into_boxed();

    if let Some(worker) = filter.worker {
        query = query.filter(detections::worker.eq(worker));
    }
    if let Some(label) = filter.label {
        query = query.filter(detections::label.eq(label));
    }
    if let Some(min) = filter.min_confidence {
        query = query.filter(detections::confidence.ge(min));
    }

    Ok(query
        .order((detections::time.asc(), detections::id.asc()))
        .select(Detection::as_select())
        .load(conn)?)
}

pub fn detections_for_recording(conn: &mut SqliteConnection, recording_id: i64) -> StoreResult<Vec<Detection>> {
    Ok(detections::table
        .filter(detections::recording_id.eq(recording_id))
        .order((detections::time.asc(), detections::id.asc()))
        .select(Detection::as_select())
        .load(conn)?)
}

pub fn upsert_taxonomy(conn: &mut SqliteConnection, entry: &Taxonomy) -> StoreResult<()> {
    diesel::insert_into(taxonomy::table)
        .values(entry)
        .on_conflict((taxonomy::worker, taxonomy::label))
        .do_update()
        .set(entry)
        .execute(conn)?;
    Ok(())
}

pub fn get_taxonomy(conn: &mut SqliteConnection, worker: &str, label: &str) -> StoreResult<Option<Taxonomy>> {
    Ok(taxonomy::table
        .find((worker, label))
        .select(Taxonomy::as_select())
        .first(conn)
        .optional()?)
}

/// Detections in `[from, to)` joined with their `(worker, label)` taxonomy.
///
/// The display name falls back from the taxonomy's common name in `locale`
/// to the worker's own common name, and finally to the raw label.
pub fn detections_with_taxonomy(
    conn: &mut SqliteConnection,
    from: NaiveDateTime,
    to: NaiveDateTime,
    locale: &str,
) -> StoreResult<Vec<EnrichedDetection>> {
    let rows: Vec<(Detection, Option<Taxonomy>)> = detections::table
        .left_join(
            taxonomy::table.on(taxonomy::worker
                .eq(detections::worker)
                .and(taxonomy::label.eq(detections::label))),
        )
        .filter(detections::time.ge(from))
        .filter(detections::time.lt(to))
        .order((detections::time.asc(), detections::id.asc()))
        .select((Detection::as_select(), Option::<Taxonomy>::as_select()))
        .load(conn)?;

    Ok(rows
        .into_iter()
        .map(|(detection, taxonomy)| {
            let display_name = taxonomy
                .as_ref()
                .and_then(|t| t.common_names.get(locale))
                .map(str::to_string)
                .or_else(|| detection.common_name.clone())
                .unwrap_or_else(|| detection.label.clone());
            EnrichedDetection {
                detection,
                taxonomy,
                display_name,
            }
        })
        .collect())
}
