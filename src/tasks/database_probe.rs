use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use diesel::prelude::*;

use super::probe::Probe;
use crate::db::{DbPool, run_pending_migrations};

/// Checks that the database answers a trivial query.
///
/// With migrations enabled the first successful check also brings the schema
/// up to date, so a database that is down at boot is picked up later instead
/// of failing the process.
pub struct DatabaseProbe {
    pool: DbPool,
    migrate: bool,
    migrated: AtomicBool,
}

impl DatabaseProbe {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            migrate: false,
            migrated: AtomicBool::new(false),
        }
    }

    pub fn with_migrations(mut self) -> Self {
        self.migrate = true;
        self
    }
}

#[rocket::async_trait]
impl Probe for DatabaseProbe {
    fn component(&self) -> &str {
        "database"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn check(&self) -> anyhow::Result<String> {
        let pool = self.pool.clone();
        let migrate = self.migrate && !self.migrated.load(Ordering::Acquire);

        // Connection is taken and released within this one check.
        let applied = tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
            let mut conn = pool.get().context("Connection failed")?;
            diesel::sql_query("SELECT 1")
                .execute(&mut conn)
                .context("Connection failed")?;

            if migrate {
                run_pending_migrations(&mut conn).context("Migrations failed")?;
            }
            Ok(migrate)
        })
        .await
        .context("database check did not complete")??;

        if applied {
            self.migrated.store(true, Ordering::Release);
        }
        Ok("Connected".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::{init_pool, test_pool};

    #[tokio::test]
    async fn reachable_database_is_connected() {
        let probe = DatabaseProbe::new(test_pool());
        assert_eq!(probe.check().await.unwrap(), "Connected");
    }

    #[tokio::test]
    async fn unreachable_database_reports_connection_failure() {
        let config = DatabaseConfig {
            connect_timeout: Duration::from_millis(200),
            ..DatabaseConfig::new("/nonexistent/silvasonic/db.sqlite")
        };
        let probe = DatabaseProbe::new(init_pool(&config)).with_migrations();

        let err = probe.check().await.unwrap_err();
        assert!(format!("{err:#}").starts_with("Connection failed"), "{err:#}");
        assert!(!probe.migrated.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn first_successful_check_applies_migrations() {
        let pool = init_pool(&DatabaseConfig::in_memory());
        let probe = DatabaseProbe::new(pool.clone()).with_migrations();

        assert_eq!(probe.check().await.unwrap(), "Connected");
        assert!(probe.migrated.load(Ordering::Acquire));

        let mut conn = pool.get().unwrap();
        assert_eq!(run_pending_migrations(&mut conn).unwrap(), 0);
    }
}
