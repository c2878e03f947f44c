//! Database layer for DisasterLink

mod conflict_repository;
mod connection;
mod ledger_repository;
mod meta_repository;
mod migrations;
mod record_repository;

pub use conflict_repository::{ConflictRepository, SqliteConflictRepository};
pub use connection::Database;
pub use ledger_repository::{LedgerRepository, SqliteLedgerRepository};
pub use meta_repository::{MetaRepository, SqliteMetaRepository, SyncMeta};
pub use record_repository::{RecordRepository, SqliteRecordRepository};
