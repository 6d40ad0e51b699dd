use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;

use crate::config::DatabaseConfig;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Per-connection pragmas. SQLite does not persist `foreign_keys`, so every
/// pooled connection has to switch it on itself.
#[derive(Debug)]
struct SqlitePragmas {
    busy_timeout_ms: u64,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {};",
            self.busy_timeout_ms
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Build the pool without opening a connection. An unreachable database is
/// a runtime condition reported by the database probe, not a startup error.
pub fn init_pool(config: &DatabaseConfig) -> DbPool {
    let manager = ConnectionManager::<SqliteConnection>::new(config.url.as_str());
    Pool::builder()
        .max_size(config.pool_size)
        .connection_timeout(config.connect_timeout)
        .connection_customizer(Box::new(SqlitePragmas {
            busy_timeout_ms: config.busy_timeout.as_millis() as u64,
        }))
        .build_unchecked(manager)
}
