//! Database migrations.
//!
//! This module contains all SQL migrations for the database schema.
//! Migrations are run in order and tracked in the `migrations` table.

use crate::{DatabaseError, DatabaseResult};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    // Create migrations tracking table
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    if current_version > CURRENT_VERSION {
        return Err(DatabaseError::Migration(format!(
            "schema version {current_version} is newer than supported version {CURRENT_VERSION}"
        )));
    }

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_outbox_items(conn)?;
    }
    if current_version < 2 {
        migrate_v2_idempotency_records(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: Outbox items.
///
/// `(status, next_attempt_at)` serves claiming, `(status, updated_at)` serves
/// dead-item browsing and delivered-item pruning.
fn migrate_v1_outbox_items(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: outbox_items");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS outbox_items (
            id TEXT PRIMARY KEY,
            scope_id TEXT,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            attempts INTEGER NOT NULL DEFAULT 0,
            next_attempt_at TEXT NOT NULL,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_items_status_next_attempt
            ON outbox_items(status, next_attempt_at);
        CREATE INDEX IF NOT EXISTS idx_outbox_items_status_updated
            ON outbox_items(status, updated_at);
        CREATE INDEX IF NOT EXISTS idx_outbox_items_kind
            ON outbox_items(kind);
        ",
    )?;

    record_migration(conn, 1, "outbox_items")?;
    Ok(())
}

/// V2: Idempotency records, one row per key.
fn migrate_v2_idempotency_records(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v2: idempotency_records");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS idempotency_records (
            key TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            failed_at TEXT,
            result TEXT,
            error TEXT,
            expires_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_idempotency_records_expires_at
            ON idempotency_records(expires_at);
        ",
    )?;

    record_migration(conn, 2, "idempotency_records")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(conn: &Connection, sql: &str) -> Vec<String> {
        conn.prepare(sql)
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_run_successfully() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables = names(
            &conn,
            "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name",
        );
        assert!(tables.contains(&"outbox_items".to_string()));
        assert!(tables.contains(&"idempotency_records".to_string()));
        assert!(tables.contains(&"migrations".to_string()));

        let indexes = names(
            &conn,
            "SELECT name FROM sqlite_master WHERE type='index' ORDER BY name",
        );
        assert!(indexes.contains(&"idx_outbox_items_status_next_attempt".to_string()));
        assert!(indexes.contains(&"idx_outbox_items_status_updated".to_string()));
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);

        let applied: i32 = conn
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, CURRENT_VERSION);
    }

    #[test]
    fn test_idempotency_key_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let insert = "INSERT INTO idempotency_records (key, status, started_at, expires_at)
                      VALUES ('k', 'in_progress', 'a', 'b')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO migrations (version, name) VALUES (?1, 'future')",
            [CURRENT_VERSION + 1],
        )
        .unwrap();

        let err = run_migrations(&conn).unwrap_err();
        assert!(matches!(err, DatabaseError::Migration(_)));
    }
}
