//! Database connection management

use std::path::{Path, PathBuf};

use rusqlite::Connection;

use super::migrations;
use crate::error::{Error, Result};

/// Database wrapper for the on-device `SQLite` file
pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;

        let mut database = Self {
            conn,
            path: Some(path),
        };
        database.configure()?;
        database.migrate()?;
        Ok(database)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;

        let mut database = Self { conn, path: None };
        database.configure()?;
        database.migrate()?;
        Ok(database)
    }

    /// Configure `SQLite` so a committed transaction is on disk before it returns
    fn configure(&self) -> Result<()> {
        // In-memory databases report "memory" and keep going
        let mode: String =
            self.conn
                .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!("SQLite journal mode: {mode}");

        self.conn.pragma_update(None, "synchronous", "FULL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.conn.pragma_update(None, "busy_timeout", 5_000)?;
        Ok(())
    }

    /// Run database migrations
    fn migrate(&mut self) -> Result<()> {
        migrations::run(&mut self.conn)
    }

    /// Run `PRAGMA quick_check`; anything but "ok" is corruption
    pub fn check_integrity(&self) -> Result<()> {
        let mut stmt = self.conn.prepare("PRAGMA quick_check")?;
        let problems = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        match problems.as_slice() {
            [only] if only == "ok" => Ok(()),
            [] => Err(Error::CorruptState("quick_check returned nothing".into())),
            _ => Err(Error::CorruptState(problems.join("; "))),
        }
    }

    /// Write a consistent copy of the database to `target`
    ///
    /// `target` must not exist.
    pub fn snapshot_to(&self, target: &Path) -> Result<()> {
        let target = target.to_string_lossy().to_string();
        self.conn.execute("VACUUM INTO ?1", [target])?;
        Ok(())
    }

    /// Path of the backing file, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Mutable access for transactions
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}
