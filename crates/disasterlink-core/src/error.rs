//! Error types for disasterlink-core

use rusqlite::ErrorCode;
use thiserror::Error;

/// Result type alias using disasterlink-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in disasterlink-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Local storage has no room for another ledger entry
    #[error("Storage full: {0}")]
    StorageFull(String),

    /// Ledger or record store is unreadable
    #[error("Corrupt local state: {0}")]
    CorruptState(String),

    /// Remote authority could not be reached (transient, retried)
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// Remote authority refused the record permanently (not retried)
    #[error("Remote rejected: {0}")]
    RemoteRejected(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Lifecycle transition not allowed from the current status
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Failures of the on-device store. These put the engine in degraded mode.
    pub const fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            Self::StorageFull(_) | Self::CorruptState(_) | Self::Database(_) | Self::Io(_)
        )
    }

    /// Failures worth retrying with backoff.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkUnavailable(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Self {
        match error.sqlite_error_code() {
            Some(ErrorCode::DiskFull) => Self::StorageFull(error.to_string()),
            Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) => {
                Self::CorruptState(error.to_string())
            }
            _ => Self::Database(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn classifies_sqlite_disk_full_as_storage_full() {
        let error = Error::from(sqlite_failure(rusqlite::ffi::SQLITE_FULL));
        assert!(matches!(error, Error::StorageFull(_)));
        assert!(error.is_storage_failure());
    }

    #[test]
    fn classifies_sqlite_corruption_as_corrupt_state() {
        let corrupt = Error::from(sqlite_failure(rusqlite::ffi::SQLITE_CORRUPT));
        let not_a_db = Error::from(sqlite_failure(rusqlite::ffi::SQLITE_NOTADB));
        assert!(matches!(corrupt, Error::CorruptState(_)));
        assert!(matches!(not_a_db, Error::CorruptState(_)));
    }

    #[test]
    fn network_errors_are_transient_but_not_storage_failures() {
        let error = Error::NetworkUnavailable("connection refused".to_string());
        assert!(error.is_transient());
        assert!(!error.is_storage_failure());
        assert!(!Error::RemoteRejected("bad".to_string()).is_transient());
    }
}
