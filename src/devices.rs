//! Directory of field nodes and their enrollment workflow.

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sqlite::SqliteConnection;
use log::info;

use crate::error::{StoreError, StoreResult};
use crate::models::{Device, DeviceStatus, EnrollmentStatus, NewDevice};
use crate::profiles;
use crate::schema::devices;

/// Register a device on first contact. It starts `pending` and `offline`.
///
/// When no profile is given, the first microphone profile whose pattern
/// matches the model is linked. The write lock is taken up front so a
/// concurrent enrollment of the same device waits and then sees the row.
pub fn enroll(conn: &mut SqliteConnection, device: &NewDevice) -> StoreResult<Device> {
    conn.immediate_transaction::<_, StoreError, _>(|conn| {
        let existing: Option<Device> = devices::table
            .filter(
                devices::name
                    .eq(&device.name)
                    .or(devices::serial_number.eq(&device.serial_number)),
            )
            .select(Device::as_select())
            .first(conn)
            .optional()?;

        if let Some(found) = existing {
            return Err(StoreError::DuplicateDevice(if found.name == device.name {
                format!("name {}", device.name)
            } else {
                format!("serial number {}", device.serial_number)
            }));
        }

        let mut row = device.clone();
        if row.profile_slug.is_none() {
            row.profile_slug = profiles::match_profile(conn, &row.model)?.map(|p| p.slug);
        }

        diesel::insert_into(devices::table)
            .values(&row)
            .execute(conn)
            .map_err(|e| match e {
                DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                    StoreError::DuplicateDevice(format!("serial number {}", row.serial_number))
                }
                other => StoreError::from(other),
            })?;

        info!(
            "Device {} ({}) enrolled as pending, profile {:?}",
            row.name, row.serial_number, row.profile_slug
        );
        get(conn, &row.name)
    })
}

pub fn get(conn: &mut SqliteConnection, name: &str) -> StoreResult<Device> {
    devices::table
        .find(name)
        .select(Device::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| StoreError::not_found("device", name))
}

pub fn list(conn: &mut SqliteConnection) -> StoreResult<Vec<Device>> {
    Ok(devices::table
        .order(devices::name.asc())
        .select(Device::as_select())
        .load(conn)?)
}

pub fn approve(conn: &mut SqliteConnection, name: &str) -> StoreResult<Device> {
    transition(conn, name, EnrollmentStatus::Enrolled)
}

pub fn reject(conn: &mut SqliteConnection, name: &str) -> StoreResult<Device> {
    transition(conn, name, EnrollmentStatus::Rejected)
}

/// `pending -> enrolled | rejected`; every other move is refused and the
/// stored row is left untouched.
fn transition(
    conn: &mut SqliteConnection,
    name: &str,
    target: EnrollmentStatus,
) -> StoreResult<Device> {
    conn.immediate_transaction::<_, StoreError, _>(|conn| {
        let current = get(conn, name)?;
        if current.enrollment_status != EnrollmentStatus::Pending
            || target == EnrollmentStatus::Pending
        {
            return Err(StoreError::InvalidTransition {
                entity: "enrollment",
                from: current.enrollment_status.to_string(),
                to: target.to_string(),
            });
        }

        let updated = diesel::update(
            devices::table
                .filter(devices::name.eq(name))
                .filter(devices::enrollment_status.eq(EnrollmentStatus::Pending)),
        )
        .set(devices::enrollment_status.eq(target))
        .execute(conn)?;

        if updated != 1 {
            return Err(StoreError::InvalidTransition {
                entity: "enrollment",
                from: get(conn, name)?.enrollment_status.to_string(),
                to: target.to_string(),
            });
        }

        info!("Device {} {}", name, target);
        get(conn, name)
    })
}

/// Record contact from a device: refresh `last_seen` and mark it online.
pub fn heartbeat(conn: &mut SqliteConnection, name: &str, at: NaiveDateTime) -> StoreResult<Device> {
    let updated = diesel::update(devices::table.find(name))
        .set((
            devices::last_seen.eq(Some(at)),
            devices::status.eq(DeviceStatus::Online),
        ))
        .execute(conn)?;

    if updated == 0 {
        return Err(StoreError::not_found("device", name));
    }
    get(conn, name)
}

/// Enable or disable a device regardless of its connectivity.
pub fn set_enabled(conn: &mut SqliteConnection, name: &str, enabled: bool) -> StoreResult<Device> {
    let updated = diesel::update(devices::table.find(name))
        .set(devices::enabled.eq(enabled))
        .execute(conn)?;

    if updated == 0 {
        return Err(StoreError::not_found("device", name));
    }
    get(conn, name)
}

/// The instant before which a device silent for `timeout` counts as stale,
/// or `None` when `timeout` reaches past the representable calendar.
pub fn stale_cutoff(now: NaiveDateTime, timeout: std::time::Duration) -> Option<NaiveDateTime> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|timeout| now.checked_sub_signed(timeout))
}

/// Flip online devices not heard from since `cutoff` to offline.
/// Returns how many were flipped.
pub fn sweep_stale(conn: &mut SqliteConnection, cutoff: NaiveDateTime) -> StoreResult<usize> {
    let flipped = diesel::update(
        devices::table
            .filter(devices::status.eq(DeviceStatus::Online))
            .filter(devices::last_seen.is_null().or(devices::last_seen.lt(cutoff))),
    )
    .set(devices::status.eq(DeviceStatus::Offline))
    .execute(conn)?;

    if flipped > 0 {
        info!("Marked {} stale device(s) offline", flipped);
    }
    Ok(flipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::{JsonObject, MicrophoneProfile};
    use crate::config::DatabaseConfig;
    use crate::db::{init_pool, run_pending_migrations};
    use chrono::{Duration, NaiveDate};
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn enroll_starts_pending_and_offline() {
        let pool = test_pool();
        let mut conn = pool.get().unwrap();

        let device = enroll(&mut conn, &NewDevice::new("mic-01", "SN-1", "UltraMic 384K")).unwrap();
        assert_eq!(device.enrollment_status, EnrollmentStatus::Pending);
        assert_eq!(device.status, DeviceStatus::Offline);
        assert!(device.enabled);
        assert!(device.last_seen.is_none());
    }

    #[test]
    fn duplicate_serial_or_name_is_rejected() {
        let pool = test_pool();
        let mut conn = pool.get().unwrap();
        enroll(&mut conn, &NewDevice::new("mic-01", "SN-1", "UltraMic")).unwrap();

        let err = enroll(&mut conn, &NewDevice::new("mic-02", "SN-1", "UltraMic")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateDevice(ref what) if what.contains("SN-1")));

        let err = enroll(&mut conn, &NewDevice::new("mic-01", "SN-9", "UltraMic")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateDevice(_)));

        assert_eq!(list(&mut conn).unwrap().len(), 1);
    }

    /// Runs `a` and `b` at the same moment on two connections to one file
    /// database and returns both outcomes.
    fn race<A, B>(pool: &crate::db::DbPool, a: A, b: B) -> (StoreResult<Device>, StoreResult<Device>)
    where
        A: FnOnce(&mut SqliteConnection) -> StoreResult<Device> + Send + 'static,
        B: FnOnce(&mut SqliteConnection) -> StoreResult<Device> + Send + 'static,
    {
        let barrier = Arc::new(Barrier::new(2));
        let spawn = |f: Box<dyn FnOnce(&mut SqliteConnection) -> StoreResult<Device> + Send>| {
            let pool = pool.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut conn = pool.get().unwrap();
                barrier.wait();
                f(&mut conn)
            })
        };
        let first = spawn(Box::new(a));
        let second = spawn(Box::new(b));
        (first.join().unwrap(), second.join().unwrap())
    }

    fn file_pool(dir: &tempfile::TempDir) -> crate::db::DbPool {
        let url = dir.path().join("devices.db").display().to_string();
        let pool = init_pool(&DatabaseConfig::new(&url));
        run_pending_migrations(&mut pool.get().unwrap()).unwrap();
        pool
    }

    #[test]
    fn concurrent_enrollment_of_one_serial_admits_exactly_one() {
        for _ in 0..10 {
            let dir = tempfile::tempdir().unwrap();
            let pool = file_pool(&dir);

            let (a, b) = race(
                &pool,
                |conn| enroll(conn, &NewDevice::new("mic-01", "SN-1", "UltraMic")),
                |conn| enroll(conn, &NewDevice::new("mic-02", "SN-1", "UltraMic")),
            );

            let admitted = [&a, &b].iter().filter(|r| r.is_ok()).count();
            assert_eq!(admitted, 1, "{a:?} {b:?}");
            for result in [a, b] {
                if let Err(e) = result {
                    assert!(matches!(e, StoreError::DuplicateDevice(_)), "{e}");
                }
            }
            assert_eq!(list(&mut pool.get().unwrap()).unwrap().len(), 1);
        }
    }

    #[test]
    fn concurrent_approve_and_reject_settle_on_one() {
        for _ in 0..10 {
            let dir = tempfile::tempdir().unwrap();
            let pool = file_pool(&dir);
            enroll(&mut pool.get().unwrap(), &NewDevice::new("mic-01", "SN-1", "UltraMic")).unwrap();

            let (approved, rejected) = race(
                &pool,
                |conn| approve(conn, "mic-01"),
                |conn| reject(conn, "mic-01"),
            );

            let winner = match (&approved, &rejected) {
                (Ok(device), Err(StoreError::InvalidTransition { .. }))
                | (Err(StoreError::InvalidTransition { .. }), Ok(device)) => device.enrollment_status,
                other => panic!("expected one transition and one typed rejection, got {other:?}"),
            };
            let stored = get(&mut pool.get().unwrap(), "mic-01").unwrap();
            assert_eq!(stored.enrollment_status, winner);
        }
    }

    #[test]
    fn only_pending_devices_transition() {
        let pool = test_pool();
        let mut conn = pool.get().unwrap();
        enroll(&mut conn, &NewDevice::new("mic-01", "SN-1", "UltraMic")).unwrap();
        enroll(&mut conn, &NewDevice::new("mic-02", "SN-2", "UltraMic")).unwrap();

        assert_eq!(approve(&mut conn, "mic-01").unwrap().enrollment_status, EnrollmentStatus::Enrolled);
        assert_eq!(reject(&mut conn, "mic-02").unwrap().enrollment_status, EnrollmentStatus::Rejected);

        for (name, result) in [
            ("mic-01", reject(&mut conn, "mic-01")),
            ("mic-01", approve(&mut conn, "mic-01")),
            ("mic-02", approve(&mut conn, "mic-02")),
        ] {
            assert!(matches!(result, Err(StoreError::InvalidTransition { .. })), "{name}");
        }

        assert_eq!(get(&mut conn, "mic-01").unwrap().enrollment_status, EnrollmentStatus::Enrolled);
        assert_eq!(get(&mut conn, "mic-02").unwrap().enrollment_status, EnrollmentStatus::Rejected);
    }

    #[test]
    fn transition_of_unknown_device_is_not_found() {
        let pool = test_pool();
        let mut conn = pool.get().unwrap();
        assert!(matches!(approve(&mut conn, "ghost"), Err(StoreError::NotFound { .. })));
        assert!(matches!(heartbeat(&mut conn, "ghost", noon()), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn heartbeat_and_sweep_drive_connectivity() {
        let pool = test_pool();
        let mut conn = pool.get().unwrap();
        enroll(&mut conn, &NewDevice::new("mic-01", "SN-1", "UltraMic")).unwrap();
        enroll(&mut conn, &NewDevice::new("mic-02", "SN-2", "UltraMic")).unwrap();

        let seen = heartbeat(&mut conn, "mic-01", noon()).unwrap();
        assert_eq!(seen.status, DeviceStatus::Online);
        assert_eq!(seen.last_seen, Some(noon()));
        heartbeat(&mut conn, "mic-02", noon() + Duration::minutes(5)).unwrap();

        let flipped = sweep_stale(&mut conn, noon() + Duration::minutes(2)).unwrap();
        assert_eq!(flipped, 1);
        assert_eq!(get(&mut conn, "mic-01").unwrap().status, DeviceStatus::Offline);
        assert_eq!(get(&mut conn, "mic-02").unwrap().status, DeviceStatus::Online);
    }

    #[test]
    fn cutoff_for_oversized_timeout_is_none() {
        assert_eq!(
            stale_cutoff(noon(), std::time::Duration::from_secs(120)),
            Some(noon() - Duration::minutes(2))
        );
        assert_eq!(stale_cutoff(noon(), std::time::Duration::from_secs(10_000_000_000_000)), None);
    }

    #[test]
    fn enabled_is_independent_of_status() {
        let pool = test_pool();
        let mut conn = pool.get().unwrap();
        enroll(&mut conn, &NewDevice::new("mic-01", "SN-1", "UltraMic")).unwrap();
        heartbeat(&mut conn, "mic-01", noon()).unwrap();

        let device = set_enabled(&mut conn, "mic-01", false).unwrap();
        assert!(!device.enabled);
        assert_eq!(device.status, DeviceStatus::Online);
    }

    #[test]
    fn enroll_links_matching_profile() {
        let pool = test_pool();
        let mut conn = pool.get().unwrap();
        profiles::upsert_profile(
            &mut conn,
            &MicrophoneProfile {
                slug: "ultramic-384".to_string(),
                name: "Dodotronic UltraMic 384K".to_string(),
                description: None,
                match_pattern: Some("ultramic".to_string()),
                config: JsonObject::new().with("sample_rate", 384_000),
                is_system: true,
            },
        )
        .unwrap();

        let linked = enroll(&mut conn, &NewDevice::new("mic-01", "SN-1", "UltraMic 384K EVO")).unwrap();
        assert_eq!(linked.profile_slug.as_deref(), Some("ultramic-384"));

        let unlinked = enroll(&mut conn, &NewDevice::new("mic-02", "SN-2", "AudioMoth")).unwrap();
        assert_eq!(unlinked.profile_slug, None);
    }
}
