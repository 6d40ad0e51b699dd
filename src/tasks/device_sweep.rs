use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::Utc;

use super::probe::Probe;
use crate::db::DbPool;
use crate::devices;

/// Flips devices that stopped sending heartbeats to offline.
///
/// Runs as a probe so that a failing sweep shows up on `/healthy`.
pub struct DeviceSweepProbe {
    pool: DbPool,
    timeout: Duration,
    interval: Duration,
}

impl DeviceSweepProbe {
    pub fn new(pool: DbPool, timeout: Duration, interval: Duration) -> Self {
        Self {
            pool,
            timeout,
            interval,
        }
    }
}

#[rocket::async_trait]
impl Probe for DeviceSweepProbe {
    fn component(&self) -> &str {
        "device_sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn check(&self) -> anyhow::Result<String> {
        let pool = self.pool.clone();
        let cutoff = devices::stale_cutoff(Utc::now().naive_utc(), self.timeout)
            .ok_or_else(|| anyhow!("device timeout {:?} out of range", self.timeout))?;

        let flipped = tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
            let mut conn = pool.get()?;
            Ok(devices::sweep_stale(&mut conn, cutoff)?)
        })
        .await
        .context("device sweep did not complete")?
        .context("Device sweep failed")?;

        Ok(format!("{flipped} stale device(s) marked offline"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::{DeviceStatus, NewDevice};

    #[tokio::test]
    async fn silent_devices_go_offline() {
        let pool = test_pool();
        {
            let mut conn = pool.get().unwrap();
            let now = Utc::now().naive_utc();
            devices::enroll(&mut conn, &NewDevice::new("mic-01", "SN-1", "UltraMic")).unwrap();
            devices::enroll(&mut conn, &NewDevice::new("mic-02", "SN-2", "UltraMic")).unwrap();
            devices::heartbeat(&mut conn, "mic-01", now - chrono::Duration::minutes(10)).unwrap();
            devices::heartbeat(&mut conn, "mic-02", now).unwrap();
        }

        let probe = DeviceSweepProbe::new(pool.clone(), Duration::from_secs(120), Duration::from_secs(30));
        assert_eq!(probe.check().await.unwrap(), "1 stale device(s) marked offline");
        assert_eq!(probe.check().await.unwrap(), "0 stale device(s) marked offline");

        let mut conn = pool.get().unwrap();
        assert_eq!(devices::get(&mut conn, "mic-01").unwrap().status, DeviceStatus::Offline);
        assert_eq!(devices::get(&mut conn, "mic-02").unwrap().status, DeviceStatus::Online);
    }

    #[tokio::test]
    async fn oversized_timeout_fails_the_check() {
        let probe = DeviceSweepProbe::new(
            test_pool(),
            Duration::from_secs(10_000_000_000_000),
            Duration::from_secs(30),
        );
        let err = probe.check().await.unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");
    }
}
