//! Materialized record repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::models::{
    AlertId, AlertRecord, EntityType, LedgerPayload, MessageId, QueuedMessage, SyncState,
};

/// Trait for materialized record storage, keyed by id
pub trait RecordRepository {
    /// Insert or replace an alert
    fn upsert_alert(&self, alert: &AlertRecord) -> Result<()>;

    /// Insert or replace a message
    fn upsert_message(&self, message: &QueuedMessage) -> Result<()>;

    /// Get an alert by ID
    fn get_alert(&self, id: &AlertId) -> Result<Option<AlertRecord>>;

    /// Get a message by ID
    fn get_message(&self, id: &MessageId) -> Result<Option<QueuedMessage>>;

    /// All alerts, newest first
    fn list_alerts(&self) -> Result<Vec<AlertRecord>>;

    /// All messages, newest first
    fn list_messages(&self) -> Result<Vec<QueuedMessage>>;

    /// Store whichever record the payload carries
    fn upsert_payload(&self, payload: &LedgerPayload) -> Result<()> {
        match payload {
            LedgerPayload::Alert(alert) => self.upsert_alert(alert),
            LedgerPayload::Message(message) => self.upsert_message(message),
        }
    }

    /// Fetch a record by type and raw id
    fn get_payload(&self, entity_type: EntityType, id: &str) -> Result<Option<LedgerPayload>>;
}

/// `SQLite` implementation of `RecordRepository`
pub struct SqliteRecordRepository<'a> {
    conn: &'a Connection,
}

struct RawRecord {
    id: String,
    body: String,
    sync_state: String,
    remote_version: Option<i64>,
}

impl<'a> SqliteRecordRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
        Ok(RawRecord {
            id: row.get(0)?,
            body: row.get(1)?,
            sync_state: row.get(2)?,
            remote_version: row.get(3)?,
        })
    }

    fn decode<T: DeserializeOwned>(raw: &RawRecord) -> Result<(T, SyncState)> {
        let record = serde_json::from_str(&raw.body).map_err(|error| {
            Error::CorruptState(format!("record {} is unreadable: {error}", raw.id))
        })?;
        let state = raw
            .sync_state
            .parse()
            .map_err(|error: String| Error::CorruptState(format!("record {}: {error}", raw.id)))?;
        Ok((record, state))
    }

    #[allow(clippy::too_many_arguments)]
    fn upsert(
        &self,
        id: &str,
        entity_type: EntityType,
        body: &str,
        sync_state: SyncState,
        remote_version: Option<i64>,
        created_at: i64,
        updated_at: i64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO records (id, entity_type, body, sync_state, remote_version, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                body = excluded.body,
                sync_state = excluded.sync_state,
                remote_version = excluded.remote_version,
                updated_at = excluded.updated_at",
            params![
                id,
                entity_type.as_str(),
                body,
                sync_state.as_str(),
                remote_version,
                created_at,
                updated_at
            ],
        )?;
        Ok(())
    }

    fn select(&self, entity_type: EntityType, id: Option<&str>) -> Result<Vec<RawRecord>> {
        let raw = if let Some(id) = id {
            self.conn
                .query_row(
                    "SELECT id, body, sync_state, remote_version FROM records
                     WHERE entity_type = ? AND id = ?",
                    params![entity_type.as_str(), id],
                    Self::parse_row,
                )
                .optional()?
                .into_iter()
                .collect()
        } else {
            let mut stmt = self.conn.prepare(
                "SELECT id, body, sync_state, remote_version FROM records
                 WHERE entity_type = ?
                 ORDER BY created_at DESC, id DESC",
            )?;
            let rows = stmt
                .query_map(params![entity_type.as_str()], Self::parse_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        Ok(raw)
    }

    fn load_alerts(&self, id: Option<&str>) -> Result<Vec<AlertRecord>> {
        self.select(EntityType::Alert, id)?
            .iter()
            .map(|raw| {
                let (mut alert, state): (AlertRecord, _) = Self::decode(raw)?;
                alert.sync_state = state;
                alert.remote_version = raw.remote_version;
                Ok(alert)
            })
            .collect()
    }

    fn load_messages(&self, id: Option<&str>) -> Result<Vec<QueuedMessage>> {
        self.select(EntityType::Message, id)?
            .iter()
            .map(|raw| {
                let (mut message, state): (QueuedMessage, _) = Self::decode(raw)?;
                message.sync_state = state;
                message.remote_version = raw.remote_version;
                Ok(message)
            })
            .collect()
    }
}

impl RecordRepository for SqliteRecordRepository<'_> {
    fn upsert_alert(&self, alert: &AlertRecord) -> Result<()> {
        let body = serde_json::to_string(alert)?;
        self.upsert(
            &alert.id.as_str(),
            EntityType::Alert,
            &body,
            alert.sync_state,
            alert.remote_version,
            alert.created_at,
            alert.updated_at,
        )
    }

    fn upsert_message(&self, message: &QueuedMessage) -> Result<()> {
        let body = serde_json::to_string(message)?;
        self.upsert(
            &message.id.as_str(),
            EntityType::Message,
            &body,
            message.sync_state,
            message.remote_version,
            message.created_at,
            message.sent_at.unwrap_or(message.created_at),
        )
    }

    fn get_alert(&self, id: &AlertId) -> Result<Option<AlertRecord>> {
        Ok(self.load_alerts(Some(&id.as_str()))?.pop())
    }

    fn get_message(&self, id: &MessageId) -> Result<Option<QueuedMessage>> {
        Ok(self.load_messages(Some(&id.as_str()))?.pop())
    }

    fn list_alerts(&self) -> Result<Vec<AlertRecord>> {
        self.load_alerts(None)
    }

    fn list_messages(&self) -> Result<Vec<QueuedMessage>> {
        self.load_messages(None)
    }

    fn get_payload(&self, entity_type: EntityType, id: &str) -> Result<Option<LedgerPayload>> {
        Ok(match entity_type {
            EntityType::Alert => self.load_alerts(Some(id))?.pop().map(LedgerPayload::Alert),
            EntityType::Message => self
                .load_messages(Some(id))?
                .pop()
                .map(LedgerPayload::Message),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{Location, Priority};
    use pretty_assertions::assert_eq;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn alert(message: &str, created_at: i64) -> AlertRecord {
        let mut alert = AlertRecord::new(message, Location::new(1.0, 2.0), Priority::High);
        alert.created_at = created_at;
        alert.updated_at = created_at;
        alert
    }

    #[test]
    fn test_alert_round_trip_keeps_sync_bookkeeping() {
        let db = setup();
        let repo = SqliteRecordRepository::new(db.connection());

        let mut stored = alert("Flooding on Mill Lane", 5);
        stored.sync_state = SyncState::Synced;
        stored.remote_version = Some(3);
        repo.upsert_alert(&stored).unwrap();

        let fetched = repo.get_alert(&stored.id).unwrap().unwrap();
        assert_eq!(fetched, stored);
    }

    #[test]
    fn test_upsert_replaces_body() {
        let db = setup();
        let repo = SqliteRecordRepository::new(db.connection());

        let mut stored = alert("Roof leaking", 5);
        repo.upsert_alert(&stored).unwrap();
        stored.resolve(9).unwrap();
        repo.upsert_alert(&stored).unwrap();

        let alerts = repo.list_alerts().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].resolved_at, Some(9));
    }

    #[test]
    fn test_list_alerts_newest_first() {
        let db = setup();
        let repo = SqliteRecordRepository::new(db.connection());

        repo.upsert_alert(&alert("first", 1)).unwrap();
        repo.upsert_alert(&alert("third", 3)).unwrap();
        repo.upsert_alert(&alert("second", 2)).unwrap();
        repo.upsert_message(&QueuedMessage::new("dad", "ok")).unwrap();

        let messages: Vec<_> = repo
            .list_alerts()
            .unwrap()
            .into_iter()
            .map(|alert| alert.message)
            .collect();
        assert_eq!(messages, vec!["third", "second", "first"]);
    }

    #[test]
    fn test_messages_are_kept_apart_from_alerts() {
        let db = setup();
        let repo = SqliteRecordRepository::new(db.connection());

        let message = QueuedMessage::new("+44 7700 900123", "At the school gym");
        repo.upsert_message(&message).unwrap();

        assert_eq!(repo.get_message(&message.id).unwrap(), Some(message));
        assert!(repo.list_alerts().unwrap().is_empty());
    }
}
