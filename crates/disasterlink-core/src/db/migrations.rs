//! Database migrations

use crate::error::Result;
use rusqlite::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    Ok(version)
}

/// Run statements atomically; a failure rolls the whole version back
fn apply(conn: &mut Connection, statements: &[&str]) -> Result<()> {
    let tx = conn.transaction()?;
    for stmt in statements {
        tx.execute(stmt, [])?;
    }
    tx.commit()?;
    Ok(())
}

/// Migration to version 1: ledger and materialized records
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    let statements = [
        // Schema version tracking
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        // Append-only mutation log; AUTOINCREMENT never reuses a sequence
        "CREATE TABLE IF NOT EXISTS ledger_entries (
            sequence INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            op_kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_ledger_entity ON ledger_entries(entity_id, sequence)",
        // Push attempts live beside the entries so entries are never rewritten
        "CREATE TABLE IF NOT EXISTS ledger_attempts (
            sequence INTEGER PRIMARY KEY REFERENCES ledger_entries(sequence) ON DELETE CASCADE,
            applied_at INTEGER NOT NULL
        )",
        // Materialized records keyed by id
        "CREATE TABLE IF NOT EXISTS records (
            id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            body TEXT NOT NULL,
            sync_state TEXT NOT NULL,
            remote_version INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_records_type_created ON records(entity_type, created_at DESC)",
        "INSERT INTO schema_version (version) VALUES (1)",
    ];

    apply(conn, &statements)?;
    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: conflict log and sync metadata
fn migrate_v2(conn: &mut Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            winner TEXT NOT NULL,
            strategy TEXT NOT NULL,
            local_payload TEXT NOT NULL,
            remote_payload TEXT,
            reason TEXT,
            detected_at INTEGER NOT NULL,
            dismissed INTEGER NOT NULL DEFAULT 0
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_entity_id ON sync_conflicts(entity_id)",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_detected_at ON sync_conflicts(detected_at DESC)",
        "CREATE TABLE IF NOT EXISTS sync_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        "INSERT INTO schema_version (version) VALUES (2)",
    ];

    apply(conn, &statements)?;
    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
            [name],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_migrations() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let mut conn = setup();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_create_ledger_and_conflict_tables() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        for table in [
            "ledger_entries",
            "ledger_attempts",
            "records",
            "sync_conflicts",
            "sync_meta",
        ] {
            assert!(table_exists(&conn, table), "missing table {table}");
        }
    }
}
