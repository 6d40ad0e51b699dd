//! Weather observations and forecasts stored next to the recordings.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use crate::error::StoreResult;
use crate::models::WeatherReading;
use crate::schema::weather;

/// Insert a reading, replacing any earlier one for the same time and source
/// (a forecast later superseded by the observation, for instance).
pub fn record_weather(conn: &mut SqliteConnection, reading: &WeatherReading) -> StoreResult<()> {
    diesel::insert_into(weather::table)
        .values(reading)
        .on_conflict((weather::time, weather::source))
        .do_update()
        .set(reading)
        .execute(conn)?;
    Ok(())
}

/// Readings in `[from, to)`, optionally from a single source.
pub fn weather_in_range(
    conn: &mut SqliteConnection,
    from: NaiveDateTime,
    to: NaiveDateTime,
    source: Option<&str>,
) -> StoreResult<Vec<WeatherReading>> {
    let mut query = weather::table
        .filter(weather::time.ge(from))
        .filter(weather::time.lt(to))
        .into_boxed();

    if let Some(source) = source {
        query = query.filter(weather::source.eq(source));
    }

    Ok(query
        .order((weather::time.asc(), weather::source.asc()))
        .select(WeatherReading::as_select())
        .load(conn)?)
}
