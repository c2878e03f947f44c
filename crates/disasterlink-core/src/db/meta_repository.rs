//! Sync metadata repository implementation

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

const PULL_CURSOR: &str = "pull_cursor";
const LAST_SNAPSHOT_AT: &str = "last_snapshot_at";
const LAST_DRAIN_AT: &str = "last_drain_at";

/// Persisted sync bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncMeta {
    /// Opaque cursor for `GET /alerts/since`
    pub pull_cursor: Option<String>,
    /// When the last known-good snapshot was written (Unix ms)
    pub last_snapshot_at: Option<i64>,
    /// When the last fully successful drain finished (Unix ms)
    pub last_drain_at: Option<i64>,
}

/// Trait for sync metadata storage operations
pub trait MetaRepository {
    /// Load metadata from the database
    fn load(&self) -> Result<SyncMeta>;

    /// Persist the pull cursor
    fn set_pull_cursor(&self, cursor: &str) -> Result<()>;

    /// Persist the snapshot time
    fn set_last_snapshot_at(&self, at: i64) -> Result<()>;

    /// Persist the last successful drain time
    fn set_last_drain_at(&self, at: i64) -> Result<()>;
}

/// `SQLite` implementation of `MetaRepository`
pub struct SqliteMetaRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteMetaRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn get_value(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_value(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }

    fn get_millis(&self, key: &str) -> Result<Option<i64>> {
        Ok(self
            .get_value(key)?
            .and_then(|value| value.trim().parse().ok()))
    }
}

impl MetaRepository for SqliteMetaRepository<'_> {
    fn load(&self) -> Result<SyncMeta> {
        Ok(SyncMeta {
            pull_cursor: self.get_value(PULL_CURSOR)?,
            last_snapshot_at: self.get_millis(LAST_SNAPSHOT_AT)?,
            last_drain_at: self.get_millis(LAST_DRAIN_AT)?,
        })
    }

    fn set_pull_cursor(&self, cursor: &str) -> Result<()> {
        self.set_value(PULL_CURSOR, cursor)
    }

    fn set_last_snapshot_at(&self, at: i64) -> Result<()> {
        self.set_value(LAST_SNAPSHOT_AT, &at.to_string())
    }

    fn set_last_drain_at(&self, at: i64) -> Result<()> {
        self.set_value(LAST_DRAIN_AT, &at.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn test_load_defaults() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteMetaRepository::new(db.connection());

        assert_eq!(repo.load().unwrap(), SyncMeta::default());
    }

    #[test]
    fn test_save_and_load() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteMetaRepository::new(db.connection());

        repo.set_pull_cursor("42").unwrap();
        repo.set_pull_cursor("43").unwrap();
        repo.set_last_snapshot_at(1_000).unwrap();
        repo.set_last_drain_at(2_000).unwrap();

        let meta = repo.load().unwrap();
        assert_eq!(meta.pull_cursor.as_deref(), Some("43"));
        assert_eq!(meta.last_snapshot_at, Some(1_000));
        assert_eq!(meta.last_drain_at, Some(2_000));
    }

    #[test]
    fn test_unparseable_millis_are_ignored() {
        let db = Database::open_in_memory().unwrap();
        db.connection()
            .execute(
                "INSERT INTO sync_meta (key, value) VALUES ('last_drain_at', 'soon')",
                [],
            )
            .unwrap();

        let repo = SqliteMetaRepository::new(db.connection());
        assert_eq!(repo.load().unwrap().last_drain_at, None);
    }
}
