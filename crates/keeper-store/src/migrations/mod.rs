//! Schema migration runner for the durable store and the local cache.
//!
//! Migrations are embedded at compile time via [`include_str!`] and applied
//! in version order, each inside its own transaction. The `schema_version`
//! table records what has been applied, so running twice is a no-op.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::{Result, StoreError};

/// A single migration with a version number and SQL to execute.
pub struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// Durable store schema.
pub const DURABLE_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "Conversations, messages, facts with dedup index",
    sql: include_str!("durable_v001_schema.sql"),
}];

/// Local cache schema.
pub const LOCAL_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Extraction cursors and memory fact mirror",
        sql: include_str!("local_v001_schema.sql"),
    },
    Migration {
        version: 2,
        description: "FTS5 index over mirrored fact summaries",
        sql: include_str!("local_v002_summary_fts.sql"),
    },
];

/// Apply every migration in `set` newer than the recorded version.
///
/// Returns the number applied.
///
/// # Errors
///
/// Returns [`StoreError::Migration`] if any migration SQL fails; that
/// migration is rolled back and later ones are not attempted.
pub fn run_migrations(conn: &Connection, set: &[Migration]) -> Result<u32> {
    ensure_version_table(conn)?;
    let current = current_version(conn)?;
    let mut applied = 0;

    for migration in set {
        if migration.version <= current {
            debug!(version = migration.version, "migration already applied, skipping");
            continue;
        }
        info!(
            version = migration.version,
            description = migration.description,
            "applying migration"
        );
        apply_migration(conn, migration)?;
        applied += 1;
    }

    if applied > 0 {
        info!(applied, "migrations complete");
    }
    Ok(applied)
}

/// Highest applied version, or 0 if none.
pub fn current_version(conn: &Connection) -> Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(|e| StoreError::Migration {
        message: format!("failed to read schema_version: {e}"),
    })
}

/// Latest version defined in `set`.
pub fn latest_version(set: &[Migration]) -> u32 {
    set.last().map_or(0, |m| m.version)
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal
// ─────────────────────────────────────────────────────────────────────────────

fn ensure_version_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
           version     INTEGER PRIMARY KEY,
           applied_at  TEXT    NOT NULL,
           description TEXT
         );",
    )
    .map_err(|e| StoreError::Migration {
        message: format!("failed to create schema_version table: {e}"),
    })
}

fn apply_migration(conn: &Connection, migration: &Migration) -> Result<()> {
    let tx = conn.unchecked_transaction().map_err(|e| StoreError::Migration {
        message: format!("failed to begin transaction for v{}: {e}", migration.version),
    })?;

    tx.execute_batch(migration.sql).map_err(|e| StoreError::Migration {
        message: format!(
            "migration v{} ({}) failed: {e}",
            migration.version, migration.description
        ),
    })?;

    let _ = tx
        .execute(
            "INSERT INTO schema_version (version, applied_at, description) VALUES (?1, datetime('now'), ?2)",
            rusqlite::params![migration.version, migration.description],
        )
        .map_err(|e| StoreError::Migration {
            message: format!("failed to record v{}: {e}", migration.version),
        })?;

    tx.commit().map_err(|e| StoreError::Migration {
        message: format!("failed to commit v{}: {e}", migration.version),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(std::result::Result::ok)
            .collect()
    }

    #[test]
    fn durable_schema_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(run_migrations(&conn, DURABLE_MIGRATIONS).unwrap(), 1);
        let tables = table_names(&conn);
        for name in ["conversations", "facts", "messages", "schema_version"] {
            assert!(tables.iter().any(|t| t == name), "missing {name}");
        }
    }

    #[test]
    fn local_schema_creates_tables_and_fts() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(run_migrations(&conn, LOCAL_MIGRATIONS).unwrap(), 2);
        let tables = table_names(&conn);
        for name in ["extraction_state", "memory_facts", "memory_facts_fts"] {
            assert!(tables.iter().any(|t| t == name), "missing {name}");
        }
        assert_eq!(current_version(&conn).unwrap(), latest_version(LOCAL_MIGRATIONS));
    }

    #[test]
    fn rerun_is_noop() {
        let conn = Connection::open_in_memory().unwrap();
        let _ = run_migrations(&conn, LOCAL_MIGRATIONS).unwrap();
        assert_eq!(run_migrations(&conn, LOCAL_MIGRATIONS).unwrap(), 0);
    }

    #[test]
    fn failing_migration_rolls_back() {
        const BROKEN: &[Migration] = &[Migration {
            version: 1,
            description: "broken",
            sql: "CREATE TABLE ok_table (x INTEGER); CREATE TABLE (",
        }];
        let conn = Connection::open_in_memory().unwrap();
        let err = run_migrations(&conn, BROKEN).unwrap_err();
        assert!(matches!(err, StoreError::Migration { .. }));
        assert!(!table_names(&conn).iter().any(|t| t == "ok_table"));
        assert_eq!(current_version(&conn).unwrap(), 0);
    }
}
