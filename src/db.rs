use anyhow::anyhow;
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};

pub mod pool;

pub use pool::{DbConn, DbPool, init_pool};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Apply every migration not yet recorded in the database.
/// Returns how many were applied.
pub fn run_pending_migrations(conn: &mut SqliteConnection) -> anyhow::Result<usize> {
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow!("failed to run migrations: {e}"))?;

    for version in &applied {
        log::info!("Applied migration {}", version);
    }

    Ok(applied.len())
}

/// Single-connection in-memory database with the schema applied.
#[cfg(test)]
pub(crate) fn test_pool() -> DbPool {
    use crate::config::DatabaseConfig;

    let pool = init_pool(&DatabaseConfig::in_memory());
    let mut conn = pool.get().expect("in-memory connection");
    run_pending_migrations(&mut conn).expect("migrations apply");
    drop(conn);
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_once() {
        let pool = test_pool();
        let mut conn = pool.get().unwrap();
        assert_eq!(run_pending_migrations(&mut conn).unwrap(), 0);
    }
}
