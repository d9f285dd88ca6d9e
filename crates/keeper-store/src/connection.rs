//! Pooled `SQLite` connections for both keeper databases.
//!
//! Every connection is opened in WAL mode with foreign keys on. `SQLite`
//! serializes writers itself; the busy timeout makes a second writer wait
//! for the lock instead of failing with `SQLITE_BUSY`.

use std::path::Path;
use std::time::Duration;

use r2d2::{CustomizeConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::errors::{Result, StoreError};

/// Pool type shared by the durable store and the local cache.
pub type ConnectionPool = Pool<SqliteConnectionManager>;

/// How long a caller waits for a free connection.
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pool sizing and per-connection pragmas.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Maximum open connections for file databases.
    pub pool_size: u32,
    /// `PRAGMA busy_timeout`, in milliseconds.
    pub busy_timeout_ms: u32,
    /// Page cache per connection, in KiB.
    pub cache_size_kib: i64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            busy_timeout_ms: 30_000,
            cache_size_kib: 8192,
        }
    }
}

#[derive(Debug)]
struct Pragmas {
    busy_timeout_ms: u32,
    cache_size_kib: i64,
}

impl CustomizeConnection<Connection, rusqlite::Error> for Pragmas {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};
             PRAGMA cache_size = -{};",
            self.busy_timeout_ms, self.cache_size_kib
        ))
    }
}

fn build(
    manager: SqliteConnectionManager,
    max_size: u32,
    keep_forever: bool,
    config: &ConnectionConfig,
) -> Result<ConnectionPool> {
    let mut builder = Pool::builder()
        .max_size(max_size)
        .connection_timeout(CHECKOUT_TIMEOUT)
        .connection_customizer(Box::new(Pragmas {
            busy_timeout_ms: config.busy_timeout_ms,
            cache_size_kib: config.cache_size_kib,
        }));
    if keep_forever {
        builder = builder.idle_timeout(None).max_lifetime(None);
    }
    Ok(builder.build(manager)?)
}

/// In-memory pool.
///
/// Each in-memory connection is a separate database, so the pool holds a
/// single connection that is never recycled.
pub fn new_in_memory(config: &ConnectionConfig) -> Result<ConnectionPool> {
    build(SqliteConnectionManager::memory(), 1, true, config)
}

/// File-backed pool. Missing parent directories are created.
pub fn new_file(path: &str, config: &ConnectionConfig) -> Result<ConnectionPool> {
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| StoreError::Internal(format!("create {}: {e}", parent.display())))?;
    }
    build(SqliteConnectionManager::file(path), config.pool_size.max(1), false, config)
}
