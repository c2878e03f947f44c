//! Durable on-device store shared by the engine and the reconciler.
//!
//! Every write runs in one `SQLite` transaction and is flushed before the
//! call returns (`synchronous = FULL`), so a crash between calls loses at most
//! the call in flight. Reads and writes are serialised through one async
//! mutex; nothing here ever touches the network.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::db::{
    ConflictRepository, Database, LedgerRepository, MetaRepository, RecordRepository,
    SqliteConflictRepository, SqliteLedgerRepository, SqliteMetaRepository,
    SqliteRecordRepository, SyncMeta,
};
use crate::error::{Error, Result};
use crate::models::{
    AlertRecord, EntityType, LedgerEntry, LedgerPayload, NewSyncConflict, OpKind, QueuedMessage,
    SyncConflict, SyncState,
};
use crate::util::unix_millis_now;

/// Which ledger entries a settlement removes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgment {
    /// Leave the ledger untouched
    None,
    /// Remove exactly this entry
    Entry(i64),
    /// Remove every pending entry of the entity up to and including this one
    Through(i64),
}

/// Outcome of one reconciler decision, applied atomically
#[derive(Debug, Clone)]
pub struct Settlement {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub acknowledge: Acknowledgment,
    /// Record as the remote authority now holds it
    pub authoritative: Option<LedgerPayload>,
    /// Remote version to remember when no authoritative record is stored
    pub remote_version: Option<i64>,
    pub conflict: Option<NewSyncConflict>,
}

/// What the store holds after a settlement
#[derive(Debug, Clone, Default)]
pub struct Settled {
    /// Materialized record with its sync bookkeeping
    pub record: Option<LedgerPayload>,
    pub conflict: Option<SyncConflict>,
}

/// Thread-safe service for ledger and record operations.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
    ledger_capacity: usize,
}

impl LocalStore {
    /// Open the store at the given filesystem path.
    ///
    /// An unreadable file is quarantined and replaced by the last snapshot.
    pub async fn open_path(db_path: impl Into<PathBuf>, ledger_capacity: usize) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Self::open_database(&db_path)?;
        let store = Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
            ledger_capacity,
        };
        store.snapshot().await?;
        Ok(store)
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory(ledger_capacity: usize) -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
            ledger_capacity,
        })
    }

    /// Where the last known-good copy of `db_path` lives
    pub fn snapshot_path(db_path: &Path) -> PathBuf {
        let mut name = db_path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".snapshot");
        db_path.with_file_name(name)
    }

    fn open_database(db_path: &Path) -> Result<Database> {
        let opened = Database::open(db_path).and_then(|db| {
            db.check_integrity()?;
            Ok(db)
        });

        match opened {
            Ok(db) => Ok(db),
            Err(Error::CorruptState(reason)) => {
                tracing::warn!(
                    "Local store at {} is unreadable: {reason}",
                    db_path.display()
                );
                Self::restore_from_snapshot(db_path)
            }
            Err(error) => Err(error),
        }
    }

    /// Quarantine the live file and reopen from the snapshot, or start empty
    fn restore_from_snapshot(db_path: &Path) -> Result<Database> {
        Self::quarantine_corrupted_db_files(db_path)?;

        let snapshot = Self::snapshot_path(db_path);
        if snapshot.exists() {
            std::fs::copy(&snapshot, db_path)?;
            let db = Database::open(db_path)?;
            db.check_integrity()?;

            let meta = SqliteMetaRepository::new(db.connection()).load()?;
            let now = unix_millis_now();
            match meta.last_snapshot_at {
                Some(taken_at) => tracing::warn!(
                    "Restored local store from snapshot; changes between {} and {} are lost ({} ms)",
                    taken_at,
                    now,
                    now - taken_at
                ),
                None => tracing::warn!(
                    "Restored local store from snapshot of unknown age; later changes are lost"
                ),
            }
            return Ok(db);
        }

        tracing::warn!(
            "No snapshot next to {}; starting with an empty local store, all unsynced changes are lost",
            db_path.display()
        );
        Database::open(db_path)
    }

    pub(crate) fn quarantine_corrupted_db_files(db_path: &Path) -> Result<()> {
        if db_path.exists() {
            let timestamp = unix_millis_now();
            let file_name = db_path
                .file_name()
                .map_or_else(|| "disasterlink.db".into(), |name| name.to_string_lossy());
            let backup_path = db_path.with_file_name(format!("{file_name}.corrupt-{timestamp}"));

            std::fs::rename(db_path, &backup_path)?;
            tracing::warn!(
                "Moved corrupted local store from {} to {}",
                db_path.display(),
                backup_path.display()
            );
        }

        let Some(parent) = db_path.parent() else {
            return Ok(());
        };
        let Some(base_name) = db_path.file_name().and_then(|name| name.to_str()) else {
            return Ok(());
        };
        let sidecar_prefix = format!("{base_name}-");
        let parent = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };

        for entry in std::fs::read_dir(parent)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with(&sidecar_prefix) {
                let path = entry.path();
                std::fs::remove_file(&path)?;
                tracing::warn!("Removed stale journal file {}", path.display());
            }
        }

        Ok(())
    }

    async fn rebuild_after_corruption(&self) -> Result<bool> {
        let Some(db_path) = self.db_path.clone() else {
            return Ok(false);
        };

        tracing::warn!(
            "Detected corrupt local store; rebuilding {} from snapshot",
            db_path.display()
        );

        let mut db = self.db.lock().await;
        let placeholder = Database::open_in_memory()?;
        drop(std::mem::replace(&mut *db, placeholder));
        *db = Self::restore_from_snapshot(&db_path)?;
        Ok(true)
    }

    /// Run `op` against the database. A `CorruptState` failure rebuilds the
    /// store before the error is returned.
    async fn run<T>(&self, op: impl FnOnce(&mut Database) -> Result<T> + Send) -> Result<T> {
        let result = {
            let mut db = self.db.lock().await;
            op(&mut db)
        };

        match result {
            Err(Error::CorruptState(reason)) => {
                if let Err(error) = self.rebuild_after_corruption().await {
                    tracing::error!("Rebuilding local store failed: {error}");
                }
                Err(Error::CorruptState(reason))
            }
            other => other,
        }
    }

    /// Append a local mutation and update its materialized record.
    pub async fn append(&self, payload: &LedgerPayload, op_kind: OpKind) -> Result<LedgerEntry> {
        let capacity = self.ledger_capacity;
        self.run(|db| {
            let tx = db.connection_mut().transaction()?;
            let entry = append_in(&tx, payload, op_kind, capacity)?;
            tx.commit()?;
            Ok(entry)
        })
        .await
    }

    /// Apply `change` to the stored record and append the result as an
    /// update, in one transaction.
    ///
    /// Returns the record and whether anything was appended; `change`
    /// returning `false` leaves the ledger untouched.
    pub async fn append_change(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        change: impl FnOnce(&mut LedgerPayload) -> Result<bool> + Send,
    ) -> Result<(LedgerPayload, bool)> {
        let capacity = self.ledger_capacity;
        self.run(move |db| {
            let tx = db.connection_mut().transaction()?;
            let mut record = SqliteRecordRepository::new(&tx)
                .get_payload(entity_type, entity_id)?
                .ok_or_else(|| Error::NotFound(format!("{entity_type} {entity_id}")))?;
            if !change(&mut record)? {
                return Ok((record, false));
            }
            append_in(&tx, &record, OpKind::Update, capacity)?;
            tx.commit()?;
            Ok((record, true))
        })
        .await
    }

    /// Pending entries ascending by sequence.
    pub async fn pending_entries(&self) -> Result<Vec<LedgerEntry>> {
        self.run(|db| SqliteLedgerRepository::new(db.connection()).pending())
            .await
    }

    /// Up to `limit` pending entries after `after`; restartable iteration.
    pub async fn pending_page(&self, after: i64, limit: usize) -> Result<Vec<LedgerEntry>> {
        self.run(|db| SqliteLedgerRepository::new(db.connection()).pending_after(after, limit))
            .await
    }

    /// Pending entries of one entity, ascending by sequence.
    pub async fn pending_for_entity(&self, entity_id: &str) -> Result<Vec<LedgerEntry>> {
        self.run(|db| SqliteLedgerRepository::new(db.connection()).pending_for_entity(entity_id))
            .await
    }

    /// Number of pending entries.
    pub async fn pending_count(&self) -> Result<usize> {
        self.run(|db| SqliteLedgerRepository::new(db.connection()).count())
            .await
    }

    /// Record that the reconciler is about to push an entry.
    pub async fn mark_attempted(&self, sequence: i64, at: i64) -> Result<()> {
        self.run(|db| SqliteLedgerRepository::new(db.connection()).mark_attempted(sequence, at))
            .await
    }

    /// Remove an entry the remote authority confirmed.
    pub async fn acknowledge(&self, sequence: i64) -> Result<bool> {
        self.run(|db| SqliteLedgerRepository::new(db.connection()).acknowledge(sequence))
            .await
    }

    /// Materialized record of one entity with its sync bookkeeping.
    pub async fn get_record(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<LedgerPayload>> {
        self.run(|db| {
            SqliteRecordRepository::new(db.connection()).get_payload(entity_type, entity_id)
        })
        .await
    }

    /// Overwrite a materialized record without touching the ledger.
    pub async fn store_record(&self, record: &LedgerPayload) -> Result<()> {
        self.run(|db| SqliteRecordRepository::new(db.connection()).upsert_payload(record))
            .await
    }

    /// Apply a reconciler decision in one transaction.
    ///
    /// The stored sync state is `Conflict` while the entity has open
    /// conflicts, `Pending` while later local entries remain, else `Synced`.
    /// An authoritative record replaces the local body only when no later
    /// local entry is waiting.
    pub async fn settle(&self, settlement: Settlement) -> Result<Settled> {
        self.run(move |db| {
            let tx = db.connection_mut().transaction()?;
            let ledger = SqliteLedgerRepository::new(&tx);
            let records = SqliteRecordRepository::new(&tx);
            let conflicts = SqliteConflictRepository::new(&tx);
            let id = settlement.entity_id.as_str();

            match &settlement.acknowledge {
                Acknowledgment::None => {}
                Acknowledgment::Entry(sequence) => {
                    ledger.acknowledge(*sequence)?;
                }
                Acknowledgment::Through(sequence) => {
                    ledger.acknowledge_entity(id, *sequence)?;
                }
            }

            let conflict = settlement
                .conflict
                .as_ref()
                .map(|conflict| conflicts.record(conflict, unix_millis_now()))
                .transpose()?;

            let still_pending = !ledger.pending_for_entity(id)?.is_empty();
            let state = if conflicts.open_count_for(id)? > 0 {
                SyncState::Conflict
            } else if still_pending {
                SyncState::Pending
            } else {
                SyncState::Synced
            };

            let current = records.get_payload(settlement.entity_type, id)?;
            let known_version = settlement.remote_version;
            let record = match (settlement.authoritative, current) {
                (Some(remote), current) if !still_pending || current.is_none() => Some(remote),
                (_, Some(local)) => Some(local),
                (remote, None) => remote,
            }
            .map(|mut record| {
                let version = known_version.or_else(|| remote_version(&record));
                set_bookkeeping(&mut record, state, version);
                record
            });

            if let Some(record) = &record {
                records.upsert_payload(record)?;
            }
            tx.commit()?;
            Ok(Settled { record, conflict })
        })
        .await
    }

    /// Store a record pulled from the remote authority.
    ///
    /// Skipped (returns `None`) while local entries for it are pending or
    /// when the stored copy is already at `version` or newer.
    pub async fn apply_remote(
        &self,
        mut record: LedgerPayload,
        version: i64,
    ) -> Result<Option<LedgerPayload>> {
        self.run(move |db| {
            let tx = db.connection_mut().transaction()?;
            let id = record.entity_id();
            if !SqliteLedgerRepository::new(&tx)
                .pending_for_entity(&id)?
                .is_empty()
            {
                return Ok(None);
            }

            let records = SqliteRecordRepository::new(&tx);
            let current = records.get_payload(record.entity_type(), &id)?;
            if current
                .as_ref()
                .and_then(remote_version)
                .is_some_and(|known| known >= version)
            {
                return Ok(None);
            }

            let state = if SqliteConflictRepository::new(&tx).open_count_for(&id)? > 0 {
                SyncState::Conflict
            } else {
                SyncState::Synced
            };
            set_bookkeeping(&mut record, state, Some(version));
            records.upsert_payload(&record)?;
            tx.commit()?;
            Ok(Some(record))
        })
        .await
    }

    /// Load all alerts, newest first.
    pub async fn load_alerts(&self) -> Result<Vec<AlertRecord>> {
        self.run(|db| SqliteRecordRepository::new(db.connection()).list_alerts())
            .await
    }

    /// Load all messages, newest first.
    pub async fn load_messages(&self) -> Result<Vec<QueuedMessage>> {
        self.run(|db| SqliteRecordRepository::new(db.connection()).list_messages())
            .await
    }

    /// Conflicts awaiting the user, newest first.
    pub async fn open_conflicts(&self) -> Result<Vec<SyncConflict>> {
        self.run(|db| SqliteConflictRepository::new(db.connection()).list_open())
            .await
    }

    /// Every recorded conflict, newest first.
    pub async fn conflict_history(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        self.run(|db| SqliteConflictRepository::new(db.connection()).list_all(limit))
            .await
    }

    /// Dismiss a conflict and recompute the entity's sync state.
    pub async fn dismiss_conflict(&self, id: i64) -> Result<(SyncConflict, Option<LedgerPayload>)> {
        self.run(|db| {
            let tx = db.connection_mut().transaction()?;
            let conflicts = SqliteConflictRepository::new(&tx);
            let conflict = conflicts
                .get(id)?
                .ok_or_else(|| Error::NotFound(format!("conflict {id}")))?;
            conflicts.dismiss(id)?;

            let entity_id = conflict.entity_id.as_str();
            let state = if conflicts.open_count_for(entity_id)? > 0 {
                SyncState::Conflict
            } else if SqliteLedgerRepository::new(&tx)
                .pending_for_entity(entity_id)?
                .is_empty()
            {
                SyncState::Synced
            } else {
                SyncState::Pending
            };

            let records = SqliteRecordRepository::new(&tx);
            let record = records
                .get_payload(conflict.entity_type, entity_id)?
                .map(|mut record| {
                    let version = remote_version(&record);
                    set_bookkeeping(&mut record, state, version);
                    record
                });
            if let Some(record) = &record {
                records.upsert_payload(record)?;
            }
            tx.commit()?;

            let conflict = SyncConflict {
                dismissed: true,
                ..conflict
            };
            Ok((conflict, record))
        })
        .await
    }

    /// Load sync bookkeeping.
    pub async fn meta(&self) -> Result<SyncMeta> {
        self.run(|db| SqliteMetaRepository::new(db.connection()).load())
            .await
    }

    /// Persist the pull cursor.
    pub async fn set_pull_cursor(&self, cursor: &str) -> Result<()> {
        self.run(|db| SqliteMetaRepository::new(db.connection()).set_pull_cursor(cursor))
            .await
    }

    /// Remember a fully successful drain.
    pub async fn record_drain_success(&self, at: i64) -> Result<()> {
        self.run(|db| SqliteMetaRepository::new(db.connection()).set_last_drain_at(at))
            .await
    }

    /// Write a known-good copy next to the database file.
    ///
    /// Returns the snapshot path, or `None` for in-memory stores.
    pub async fn snapshot(&self) -> Result<Option<PathBuf>> {
        let Some(db_path) = self.db_path.clone() else {
            return Ok(None);
        };

        let target = Self::snapshot_path(&db_path);
        let mut staging = target.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        self.run(|db| {
            SqliteMetaRepository::new(db.connection()).set_last_snapshot_at(unix_millis_now())?;
            if staging.exists() {
                std::fs::remove_file(&staging)?;
            }
            db.snapshot_to(&staging)?;
            std::fs::rename(&staging, &target)?;
            Ok(())
        })
        .await?;

        tracing::debug!("Wrote local store snapshot to {}", target.display());
        Ok(Some(target))
    }
}

fn remote_version(record: &LedgerPayload) -> Option<i64> {
    match record {
        LedgerPayload::Alert(alert) => alert.remote_version,
        LedgerPayload::Message(message) => message.remote_version,
    }
}

fn set_bookkeeping(record: &mut LedgerPayload, state: SyncState, version: Option<i64>) {
    match record {
        LedgerPayload::Alert(alert) => {
            alert.sync_state = state;
            alert.remote_version = version;
        }
        LedgerPayload::Message(message) => {
            message.sync_state = state;
            message.remote_version = version;
        }
    }
}

fn append_in(
    conn: &Connection,
    payload: &LedgerPayload,
    op_kind: OpKind,
    capacity: usize,
) -> Result<LedgerEntry> {
    let ledger = SqliteLedgerRepository::new(conn);
    let pending = ledger.count()?;
    if pending >= capacity {
        return Err(Error::StorageFull(format!(
            "ledger holds {pending} pending entries (capacity {capacity})"
        )));
    }

    let entry = ledger.append(payload, op_kind, unix_millis_now())?;
    let mut record = payload.clone();
    set_bookkeeping(&mut record, SyncState::Pending, existing_version(conn, payload)?);
    SqliteRecordRepository::new(conn).upsert_payload(&record)?;

    tracing::debug!(
        sequence = entry.sequence,
        entity = %entry.entity_id,
        "Appended {} {}",
        op_kind.as_str(),
        entry.entity_type
    );
    Ok(entry)
}

/// Remote version already known for the entity a payload describes
fn existing_version(conn: &Connection, payload: &LedgerPayload) -> Result<Option<i64>> {
    let current = SqliteRecordRepository::new(conn)
        .get_payload(payload.entity_type(), &payload.entity_id())?;
    Ok(current.as_ref().and_then(remote_version))
}
