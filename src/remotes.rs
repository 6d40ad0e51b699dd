//! Remote storage targets that recordings are backed up to.

use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::info;

use crate::error::{StoreError, StoreResult};
use crate::models::{JsonObject, NewStorageRemote, StorageRemote};
use crate::schema::storage_remotes;

pub fn create_remote(
    conn: &mut SqliteConnection,
    slug: &str,
    remote_type: &str,
    name: &str,
    config: JsonObject,
    target_path: Option<&str>,
) -> StoreResult<StorageRemote> {
    let now = Utc::now().naive_utc();
    diesel::insert_into(storage_remotes::table)
        .values(&NewStorageRemote {
            slug,
            remote_type,
            name,
            config,
            is_active: true,
            target_path,
            created_at: now,
            updated_at: now,
        })
        .execute(conn)?;

    info!("Storage remote {} ({}) created", slug, remote_type);
    get_remote(conn, slug)
}

pub fn get_remote(conn: &mut SqliteConnection, slug: &str) -> StoreResult<StorageRemote> {
    storage_remotes::table
        .find(slug)
        .select(StorageRemote::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| StoreError::not_found("storage remote", slug))
}

/// Remotes the uploader should currently sync to.
pub fn active_remotes(conn: &mut SqliteConnection) -> StoreResult<Vec<StorageRemote>> {
    Ok(storage_remotes::table
        .filter(storage_remotes::is_active.eq(true))
        .order(storage_remotes::slug.asc())
        .select(StorageRemote::as_select())
        .load(conn)?)
}

pub fn set_remote_active(
    conn: &mut SqliteConnection,
    slug: &str,
    active: bool,
) -> StoreResult<StorageRemote> {
    let updated = diesel::update(storage_remotes::table.find(slug))
        .set((
            storage_remotes::is_active.eq(active),
            storage_remotes::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;

    if updated == 0 {
        return Err(StoreError::not_found("storage remote", slug));
    }
    get_remote(conn, slug)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[test]
    fn inactive_remotes_are_not_listed() {
        let pool = test_pool();
        let mut conn = pool.get().unwrap();
        create_remote(&mut conn, "nextcloud", "webdav", "Lab Nextcloud", JsonObject::new(), None).unwrap();
        create_remote(
            &mut conn,
            "s3-archive",
            "s3",
            "Archive",
            JsonObject::new().with("region", "eu-central-1"),
            Some("/silvasonic"),
        )
        .unwrap();

        let paused = set_remote_active(&mut conn, "nextcloud", false).unwrap();
        assert!(!paused.is_active);
        assert!(paused.updated_at >= paused.created_at);

        let active: Vec<_> = active_remotes(&mut conn)
            .unwrap()
            .into_iter()
            .map(|r| r.slug)
            .collect();
        assert_eq!(active, vec!["s3-archive".to_string()]);
    }

    #[test]
    fn unknown_remote_is_not_found() {
        let pool = test_pool();
        let mut conn = pool.get().unwrap();
        assert!(matches!(
            set_remote_active(&mut conn, "nowhere", true),
            Err(StoreError::NotFound { .. })
        ));
    }
}
