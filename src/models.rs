use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use diesel::deserialize::{self, FromSql};
use diesel::prelude::*;
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::Text;
use diesel::sqlite::{Sqlite, SqliteValue};
use diesel::{AsExpression, FromSqlRow};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::schema::{
    detections, devices, microphone_profiles, recordings, storage_remotes, system_config, taxonomy,
    uploads, weather,
};

/// Stores a serde type as JSON text. Rows whose text does not match the
/// declared shape fail to load instead of being passed through.
macro_rules! json_text_column {
    ($ty:ty) => {
        impl ToSql<Text, Sqlite> for $ty {
            fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
                out.set_value(serde_json::to_string(self)?);
                Ok(IsNull::No)
            }
        }

        impl FromSql<Text, Sqlite> for $ty {
            fn from_sql(value: SqliteValue<'_, '_, '_>) -> deserialize::Result<Self> {
                let raw = <String as FromSql<Text, Sqlite>>::from_sql(value)?;
                Ok(serde_json::from_str(&raw)?)
            }
        }
    };
}

/// A closed set of states kept in a TEXT column.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
        #[diesel(sql_type = Text)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(StoreError::UnknownValue {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl ToSql<Text, Sqlite> for $name {
            fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
                out.set_value(self.as_str());
                Ok(IsNull::No)
            }
        }

        impl FromSql<Text, Sqlite> for $name {
            fn from_sql(value: SqliteValue<'_, '_, '_>) -> deserialize::Result<Self> {
                let raw = <String as FromSql<Text, Sqlite>>::from_sql(value)?;
                Ok(raw.parse()?)
            }
        }
    };
}

text_enum!(
    /// Connectivity of a field node, driven by heartbeats and the liveness sweep.
    DeviceStatus, "device status" {
        Online => "online",
        Offline => "offline",
    }
);

text_enum!(
    /// Enrollment workflow. Only `Pending` may move, and only once.
    EnrollmentStatus, "enrollment status" {
        Pending => "pending",
        Enrolled => "enrolled",
        Rejected => "rejected",
    }
);

/// Free-form settings that must at least be a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = Text)]
#[serde(transparent)]
pub struct JsonObject(pub serde_json::Map<String, Value>);

json_text_column!(JsonObject);

impl JsonObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

/// Any JSON document: object, array or scalar.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = Text)]
#[serde(transparent)]
pub struct JsonValue(pub Value);

json_text_column!(JsonValue);

/// Localized text keyed by locale, e.g. `{"de": "Amsel", "en": "Blackbird"}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = Text)]
#[serde(transparent)]
pub struct LocaleText(pub BTreeMap<String, String>);

json_text_column!(LocaleText);

impl LocaleText {
    pub fn get(&self, locale: &str) -> Option<&str> {
        self.0.get(locale).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisEntry {
    pub status: AnalysisStatus,
    pub updated_at: NaiveDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-worker analysis progress of one recording (`recordings.analysis_state`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = Text)]
#[serde(transparent)]
pub struct AnalysisState(pub BTreeMap<String, AnalysisEntry>);

json_text_column!(AnalysisState);

impl AnalysisState {
    pub fn get(&self, worker: &str) -> Option<&AnalysisEntry> {
        self.0.get(worker)
    }

    pub fn set(&mut self, worker: &str, entry: AnalysisEntry) {
        self.0.insert(worker.to_string(), entry);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Success,
    Failed,
}

/// Latest known upload state of a recording on one remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteUploadSummary {
    pub status: UploadStatus,
    pub last_attempt_at: NaiveDateTime,
    pub attempts: u32,
    pub filename: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<NaiveDateTime>,
}

/// Summary of upload attempts per remote slug (`recordings.upload_info`).
///
/// This is a cache over the `uploads` ledger, not the record of truth.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = Text)]
#[serde(transparent)]
pub struct UploadInfo(pub BTreeMap<String, RemoteUploadSummary>);

json_text_column!(UploadInfo);

impl UploadInfo {
    pub fn get(&self, remote: &str) -> Option<&RemoteUploadSummary> {
        self.0.get(remote)
    }

    /// Fold one ledger row into the summary. Status fields follow the most
    /// recent attempt; an older attempt arriving late only bumps the counter.
    pub fn record(&mut self, attempt: &Upload) {
        let status = if attempt.success {
            UploadStatus::Success
        } else {
            UploadStatus::Failed
        };
        let success_at = attempt.success.then_some(attempt.attempt_at);

        match self.0.get_mut(&attempt.remote_slug) {
            Some(summary) => {
                summary.attempts += 1;
                if let Some(at) = success_at {
                    summary.last_success_at = summary.last_success_at.max(Some(at));
                }
                if attempt.attempt_at >= summary.last_attempt_at {
                    summary.status = status;
                    summary.last_attempt_at = attempt.attempt_at;
                    summary.filename = attempt.filename.clone();
                    summary.size = attempt.size;
                    summary.last_error = attempt.error_message.clone();
                }
            }
            None => {
                self.0.insert(
                    attempt.remote_slug.clone(),
                    RemoteUploadSummary {
                        status,
                        last_attempt_at: attempt.attempt_at,
                        attempts: 1,
                        filename: attempt.filename.clone(),
                        size: attempt.size,
                        last_error: attempt.error_message.clone(),
                        last_success_at: success_at,
                    },
                );
            }
        }
    }

    /// Whether the file has ever landed on `remote`.
    pub fn has_success(&self, remote: &str) -> bool {
        self.0
            .get(remote)
            .is_some_and(|s| s.last_success_at.is_some())
    }

    pub fn any_success(&self) -> bool {
        self.0.values().any(|s| s.last_success_at.is_some())
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset, Serialize, Deserialize)]
#[diesel(table_name = microphone_profiles)]
#[diesel(primary_key(slug))]
#[diesel(treat_none_as_null = true)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct MicrophoneProfile {
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub match_pattern: Option<String>,
    pub config: JsonObject,
    pub is_system: bool,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = devices)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Device {
    pub name: String,
    pub serial_number: String,
    pub model: String,
    pub status: DeviceStatus,
    pub enrollment_status: EnrollmentStatus,
    pub last_seen: Option<NaiveDateTime>,
    pub enabled: bool,
    pub profile_slug: Option<String>,
    pub config: JsonObject,
}

/// What a node announces on first contact. Status columns are not part of
/// it: a new device always starts `pending` and `offline`.
#[derive(Debug, Clone, Insertable, Deserialize)]
#[diesel(table_name = devices)]
pub struct NewDevice {
    pub name: String,
    pub serial_number: String,
    pub model: String,
    pub profile_slug: Option<String>,
    pub config: JsonObject,
}

impl NewDevice {
    pub fn new(name: &str, serial_number: &str, model: &str) -> Self {
        Self {
            name: name.to_string(),
            serial_number: serial_number.to_string(),
            model: model.to_string(),
            profile_slug: None,
            config: JsonObject::default(),
        }
    }

    pub fn with_profile(mut self, slug: &str) -> Self {
        self.profile_slug = Some(slug.to_string());
        self
    }

    pub fn with_config(mut self, config: JsonObject) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = storage_remotes)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct StorageRemote {
    pub slug: String,
    pub remote_type: String,
    pub name: String,
    pub config: JsonObject,
    pub is_active: bool,
    pub target_path: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = storage_remotes)]
pub struct NewStorageRemote<'a> {
    pub slug: &'a str,
    pub remote_type: &'a str,
    pub name: &'a str,
    pub config: JsonObject,
    pub is_active: bool,
    pub target_path: Option<&'a str>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = recordings)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Recording {
    pub id: i64,
    pub time: NaiveDateTime,
    pub sensor_id: String,
    pub file_raw: String,
    pub file_processed: String,
    pub duration: f64,
    pub sample_rate: i32,
    pub filesize_raw: i64,
    pub filesize_processed: i64,
    pub uploaded: bool,
    pub uploaded_at: Option<NaiveDateTime>,
    pub local_deleted: bool,
    pub analysis_state: AnalysisState,
    pub upload_info: UploadInfo,
    pub version: i32,
}

/// A finished capture. Lifecycle columns take their defaults on insert.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = recordings)]
pub struct NewRecording<'a> {
    pub time: NaiveDateTime,
    pub sensor_id: &'a str,
    pub file_raw: &'a str,
    pub file_processed: &'a str,
    pub duration: f64,
    pub sample_rate: i32,
    pub filesize_raw: i64,
    pub filesize_processed: i64,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = uploads)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Upload {
    pub id: i64,
    pub recording_id: i64,
    pub remote_slug: String,
    pub attempt_at: NaiveDateTime,
    pub filename: String,
    pub size: i64,
    pub success: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = uploads)]
pub struct NewUpload<'a> {
    pub recording_id: i64,
    pub remote_slug: &'a str,
    pub attempt_at: NaiveDateTime,
    pub filename: &'a str,
    pub size: i64,
    pub success: bool,
    pub error_message: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = detections)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Detection {
    pub time: NaiveDateTime,
    pub id: i64,
    pub end_time: NaiveDateTime,
    pub recording_id: i64,
    pub worker: String,
    pub confidence: f64,
    pub label: String,
    pub common_name: Option<String>,
    pub details: JsonObject,
}

#[derive(Debug, Clone, Insertable, Deserialize)]
#[diesel(table_name = detections)]
pub struct NewDetection {
    pub time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub recording_id: i64,
    pub worker: String,
    pub confidence: f64,
    pub label: String,
    pub common_name: Option<String>,
    pub details: JsonObject,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, AsChangeset, Serialize, Deserialize)]
#[diesel(table_name = taxonomy)]
#[diesel(primary_key(worker, label))]
#[diesel(treat_none_as_null = true)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Taxonomy {
    pub worker: String,
    pub label: String,
    pub scientific_name: String,
    pub common_names: LocaleText,
    pub description: LocaleText,
    pub image_path: Option<String>,
    pub image_source: Option<String>,
    /// IUCN Red List category (LC, EN, ...).
    pub conservation_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, AsChangeset, Serialize, Deserialize)]
#[diesel(table_name = weather)]
#[diesel(primary_key(time, source))]
#[diesel(treat_none_as_null = true)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct WeatherReading {
    pub time: NaiveDateTime,
    /// e.g. `local_bme280`, `openmeteo`
    pub source: String,
    pub station_code: Option<String>,
    pub temp_c: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub wind_speed_kmh: Option<f64>,
    pub wind_gusts_kmh: Option<f64>,
    pub precipitation_mm: Option<f64>,
    pub cloud_cover: Option<i32>,
    pub uv_index: Option<f64>,
    pub sunshine_duration: Option<f64>,
    pub weather_code: Option<i32>,
    pub is_forecast: bool,
    pub extra: JsonObject,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = system_config)]
#[diesel(primary_key(key))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SystemSetting {
    pub key: String,
    pub value: JsonValue,
}
