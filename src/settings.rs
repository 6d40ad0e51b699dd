//! Global key-value settings shared by every service on the node.

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::info;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{StoreError, StoreResult};
use crate::models::{JsonValue, SystemSetting};
use crate::schema::system_config;

pub fn get_setting(conn: &mut SqliteConnection, key: &str) -> StoreResult<Option<serde_json::Value>> {
    Ok(system_config::table
        .find(key)
        .select(SystemSetting::as_select())
        .first(conn)
        .optional()?
        .map(|setting| setting.value.0))
}

/// Load a setting into `T`, or `default` when the key was never written.
pub fn load_setting<T: DeserializeOwned>(conn: &mut SqliteConnection, key: &str, default: T) -> StoreResult<T> {
    match get_setting(conn, key)? {
        None => Ok(default),
        Some(value) => serde_json::from_value(value).map_err(|source| StoreError::SettingShape {
            key: key.to_string(),
            source,
        }),
    }
}

/// Insert or replace a setting.
pub fn save_setting<T: Serialize>(conn: &mut SqliteConnection, key: &str, value: &T) -> StoreResult<()> {
    let setting = SystemSetting {
        key: key.to_string(),
        value: JsonValue(serde_json::to_value(value).map_err(|source| StoreError::SettingShape {
            key: key.to_string(),
            source,
        })?),
    };

    diesel::insert_into(system_config::table)
        .values(&setting)
        .on_conflict(system_config::key)
        .do_update()
        .set(system_config::value.eq(&setting.value))
        .execute(conn)?;

    info!("Setting {} saved", key);
    Ok(())
}
