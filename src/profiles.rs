//! Microphone profiles linked to devices.

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use crate::error::StoreResult;
use crate::models::MicrophoneProfile;
use crate::schema::microphone_profiles;

/// Insert or replace a profile by slug.
pub fn upsert_profile(conn: &mut SqliteConnection, profile: &MicrophoneProfile) -> StoreResult<()> {
    diesel::insert_into(microphone_profiles::table)
        .values(profile)
        .on_conflict(microphone_profiles::slug)
        .do_update()
        .set(profile)
        .execute(conn)?;
    Ok(())
}

pub fn get_profile(conn: &mut SqliteConnection, slug: &str) -> StoreResult<Option<MicrophoneProfile>> {
    Ok(microphone_profiles::table
        .find(slug)
        .select(MicrophoneProfile::as_select())
        .first(conn)
        .optional()?)
}

/// First profile whose `match_pattern` occurs in `model`, ignoring case.
/// Operator-defined profiles win over bootstrapped system ones.
pub fn match_profile(conn: &mut SqliteConnection, model: &str) -> StoreResult<Option<MicrophoneProfile>> {
    let candidates = microphone_profiles::table
        .filter(microphone_profiles::match_pattern.is_not_null())
        .order((microphone_profiles::is_system.asc(), microphone_profiles::slug.asc()))
        .select(MicrophoneProfile::as_select())
        .load(conn)?;

    let model = model.to_lowercase();
    Ok(candidates.into_iter().find(|profile| {
        profile
            .match_pattern
            .as_deref()
            .is_some_and(|pattern| !pattern.is_empty() && model.contains(&pattern.to_lowercase()))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::JsonObject;

    fn profile(slug: &str, pattern: Option<&str>, is_system: bool) -> MicrophoneProfile {
        MicrophoneProfile {
            slug: slug.to_string(),
            name: slug.to_uppercase(),
            description: None,
            match_pattern: pattern.map(str::to_string),
            config: JsonObject::default(),
            is_system,
        }
    }

    #[test]
    fn upsert_replaces_existing_profile() {
        let pool = test_pool();
        let mut conn = pool.get().unwrap();

        upsert_profile(&mut conn, &profile("audiomoth", Some("moth"), true)).unwrap();
        let mut changed = profile("audiomoth", None, true);
        changed.description = Some("AudioMoth 1.2".to_string());
        upsert_profile(&mut conn, &changed).unwrap();

        let stored = get_profile(&mut conn, "audiomoth").unwrap().unwrap();
        assert_eq!(stored.match_pattern, None);
        assert_eq!(stored.description.as_deref(), Some("AudioMoth 1.2"));
        assert!(get_profile(&mut conn, "missing").unwrap().is_none());
    }

    #[test]
    fn operator_profiles_take_precedence() {
        let pool = test_pool();
        let mut conn = pool.get().unwrap();
        upsert_profile(&mut conn, &profile("a-system", Some("ultramic"), true)).unwrap();
        upsert_profile(&mut conn, &profile("z-custom", Some("UltraMic 384"), false)).unwrap();

        let found = match_profile(&mut conn, "Dodotronic ULTRAMIC 384K").unwrap().unwrap();
        assert_eq!(found.slug, "z-custom");
        assert!(match_profile(&mut conn, "AudioMoth").unwrap().is_none());
    }
}
