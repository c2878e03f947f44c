//! Ledger repository implementation

#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)] // SQLite uses i64 for LIMIT and COUNT

use rusqlite::{params, Connection};

use crate::error::{Error, Result};
use crate::models::{LedgerEntry, LedgerPayload, OpKind};

/// Trait for append-only ledger storage
pub trait LedgerRepository {
    /// Append a mutation and return it with its assigned sequence
    fn append(&self, payload: &LedgerPayload, op_kind: OpKind, created_at: i64)
        -> Result<LedgerEntry>;

    /// All pending entries, ascending by sequence
    fn pending(&self) -> Result<Vec<LedgerEntry>>;

    /// Up to `limit` pending entries with a sequence greater than `after`
    fn pending_after(&self, after: i64, limit: usize) -> Result<Vec<LedgerEntry>>;

    /// Pending entries for one entity, ascending by sequence
    fn pending_for_entity(&self, entity_id: &str) -> Result<Vec<LedgerEntry>>;

    /// Remove an acknowledged entry. Returns `false` if it was already gone.
    fn acknowledge(&self, sequence: i64) -> Result<bool>;

    /// Remove every pending entry of the entity up to and including `through`
    fn acknowledge_entity(&self, entity_id: &str, through: i64) -> Result<usize>;

    /// Record that the reconciler tried to push the entry
    fn mark_attempted(&self, sequence: i64, at: i64) -> Result<()>;

    /// Number of pending entries
    fn count(&self) -> Result<usize>;
}

/// `SQLite` implementation of `LedgerRepository`
pub struct SqliteLedgerRepository<'a> {
    conn: &'a Connection,
}

/// Columns as stored, before the payload is decoded
struct RawEntry {
    sequence: i64,
    entity_type: String,
    entity_id: String,
    op_kind: String,
    payload: String,
    created_at: i64,
    applied_at: Option<i64>,
}

const SELECT_ENTRY: &str = "SELECT e.sequence, e.entity_type, e.entity_id, e.op_kind, e.payload,
        e.created_at, a.applied_at
     FROM ledger_entries e
     LEFT JOIN ledger_attempts a ON a.sequence = e.sequence";

impl<'a> SqliteLedgerRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
        Ok(RawEntry {
            sequence: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            op_kind: row.get(3)?,
            payload: row.get(4)?,
            created_at: row.get(5)?,
            applied_at: row.get(6)?,
        })
    }

    /// Decode a stored row; an undecodable entry means the ledger is corrupt
    fn decode(raw: RawEntry) -> Result<LedgerEntry> {
        let payload: LedgerPayload = serde_json::from_str(&raw.payload).map_err(|error| {
            Error::CorruptState(format!(
                "ledger entry {} has unreadable payload: {error}",
                raw.sequence
            ))
        })?;
        let entity_type = raw.entity_type.parse()?;
        if payload.entity_type() != entity_type || payload.entity_id() != raw.entity_id {
            return Err(Error::CorruptState(format!(
                "ledger entry {} payload does not match {}/{}",
                raw.sequence, raw.entity_type, raw.entity_id
            )));
        }

        Ok(LedgerEntry {
            sequence: raw.sequence,
            entity_type,
            entity_id: raw.entity_id,
            payload,
            op_kind: raw.op_kind.parse()?,
            created_at: raw.created_at,
            applied_at: raw.applied_at,
        })
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<LedgerEntry>> {
        let mut stmt = self.conn.prepare(sql)?;
        let raw = stmt
            .query_map(params, Self::parse_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(Self::decode).collect()
    }
}

impl LedgerRepository for SqliteLedgerRepository<'_> {
    fn append(
        &self,
        payload: &LedgerPayload,
        op_kind: OpKind,
        created_at: i64,
    ) -> Result<LedgerEntry> {
        let body = serde_json::to_string(payload)?;
        let entity_type = payload.entity_type();
        let entity_id = payload.entity_id();

        self.conn.execute(
            "INSERT INTO ledger_entries (entity_type, entity_id, op_kind, payload, created_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                entity_type.as_str(),
                entity_id,
                op_kind.as_str(),
                body,
                created_at
            ],
        )?;

        Ok(LedgerEntry {
            sequence: self.conn.last_insert_rowid(),
            entity_type,
            entity_id,
            payload: payload.clone(),
            op_kind,
            created_at,
            applied_at: None,
        })
    }

    fn pending(&self) -> Result<Vec<LedgerEntry>> {
        self.query(&format!("{SELECT_ENTRY} ORDER BY e.sequence ASC"), [])
    }

    fn pending_after(&self, after: i64, limit: usize) -> Result<Vec<LedgerEntry>> {
        self.query(
            &format!("{SELECT_ENTRY} WHERE e.sequence > ? ORDER BY e.sequence ASC LIMIT ?"),
            params![after, limit as i64],
        )
    }

    fn pending_for_entity(&self, entity_id: &str) -> Result<Vec<LedgerEntry>> {
        self.query(
            &format!("{SELECT_ENTRY} WHERE e.entity_id = ? ORDER BY e.sequence ASC"),
            params![entity_id],
        )
    }

    fn acknowledge(&self, sequence: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM ledger_entries WHERE sequence = ?",
            params![sequence],
        )?;
        Ok(rows > 0)
    }

    fn acknowledge_entity(&self, entity_id: &str, through: i64) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM ledger_entries WHERE entity_id = ? AND sequence <= ?",
            params![entity_id, through],
        )?;
        Ok(rows)
    }

    fn mark_attempted(&self, sequence: i64, at: i64) -> Result<()> {
        let rows = self.conn.execute(
            "INSERT INTO ledger_attempts (sequence, applied_at)
             SELECT sequence, ?2 FROM ledger_entries WHERE sequence = ?1
             ON CONFLICT(sequence) DO UPDATE SET applied_at = excluded.applied_at",
            params![sequence, at],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("ledger entry {sequence}")));
        }
        Ok(())
    }

    fn count(&self) -> Result<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM ledger_entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{AlertRecord, Location, Priority, QueuedMessage};
    use pretty_assertions::assert_eq;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn alert_payload() -> LedgerPayload {
        LedgerPayload::Alert(AlertRecord::new(
            "Trapped on 3rd floor, need evacuation",
            Location::new(51.5, -0.12),
            Priority::Critical,
        ))
    }

    #[test]
    fn test_append_assigns_increasing_sequences() {
        let db = setup();
        let repo = SqliteLedgerRepository::new(db.connection());

        let first = repo.append(&alert_payload(), OpKind::Create, 10).unwrap();
        let second = repo
            .append(
                &LedgerPayload::Message(QueuedMessage::new("dad", "ok")),
                OpKind::Create,
                11,
            )
            .unwrap();

        assert!(second.sequence > first.sequence);
        let pending = repo.pending().unwrap();
        assert_eq!(pending, vec![first, second]);
    }

    #[test]
    fn test_sequences_are_not_reused_after_acknowledge() {
        let db = setup();
        let repo = SqliteLedgerRepository::new(db.connection());

        let first = repo.append(&alert_payload(), OpKind::Create, 1).unwrap();
        assert!(repo.acknowledge(first.sequence).unwrap());
        assert!(!repo.acknowledge(first.sequence).unwrap());

        let second = repo.append(&alert_payload(), OpKind::Create, 2).unwrap();
        assert!(second.sequence > first.sequence);
    }

    #[test]
    fn test_pending_after_pages_in_order() {
        let db = setup();
        let repo = SqliteLedgerRepository::new(db.connection());
        for at in 0..5 {
            repo.append(&alert_payload(), OpKind::Create, at).unwrap();
        }

        let page = repo.pending_after(0, 2).unwrap();
        assert_eq!(page.len(), 2);
        let rest = repo.pending_after(page[1].sequence, 10).unwrap();
        assert_eq!(rest.len(), 3);
        assert!(rest[0].sequence > page[1].sequence);
    }

    #[test]
    fn test_entity_queries() {
        let db = setup();
        let repo = SqliteLedgerRepository::new(db.connection());

        let payload = alert_payload();
        let id = payload.entity_id();
        let create = repo.append(&payload, OpKind::Create, 1).unwrap();
        let update = repo.append(&payload, OpKind::Update, 2).unwrap();
        repo.append(&alert_payload(), OpKind::Create, 3).unwrap();
        let later = repo.append(&payload, OpKind::Update, 4).unwrap();

        let pending = repo.pending_for_entity(&id).unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].sequence, create.sequence);

        assert_eq!(repo.acknowledge_entity(&id, update.sequence).unwrap(), 2);
        assert_eq!(repo.count().unwrap(), 2);
        assert_eq!(repo.pending_for_entity(&id).unwrap()[0].sequence, later.sequence);
    }

    #[test]
    fn test_mark_attempted_does_not_touch_entry() {
        let db = setup();
        let repo = SqliteLedgerRepository::new(db.connection());
        let entry = repo.append(&alert_payload(), OpKind::Create, 1).unwrap();

        repo.mark_attempted(entry.sequence, 50).unwrap();
        repo.mark_attempted(entry.sequence, 60).unwrap();

        let stored = &repo.pending().unwrap()[0];
        assert_eq!(stored.applied_at, Some(60));
        assert_eq!(stored.payload, entry.payload);

        assert!(matches!(
            repo.mark_attempted(entry.sequence + 1, 70),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_acknowledge_clears_attempt_row() {
        let db = setup();
        let repo = SqliteLedgerRepository::new(db.connection());
        let entry = repo.append(&alert_payload(), OpKind::Create, 1).unwrap();
        repo.mark_attempted(entry.sequence, 5).unwrap();
        repo.acknowledge(entry.sequence).unwrap();

        let attempts: i64 = db
            .connection()
            .query_row("SELECT COUNT(*) FROM ledger_attempts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(attempts, 0);
    }

    #[test]
    fn test_unreadable_payload_is_corrupt_state() {
        let db = setup();
        db.connection()
            .execute(
                "INSERT INTO ledger_entries (entity_type, entity_id, op_kind, payload, created_at)
                 VALUES ('alert', 'x', 'create', '{not json', 1)",
                [],
            )
            .unwrap();

        let repo = SqliteLedgerRepository::new(db.connection());
        assert!(matches!(repo.pending(), Err(Error::CorruptState(_))));
    }
}
