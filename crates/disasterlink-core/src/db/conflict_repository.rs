//! Sync conflict repository implementation

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::{LedgerPayload, NewSyncConflict, SyncConflict, PRIORITY_THEN_RECENCY};

/// Trait for recorded sync conflicts
pub trait ConflictRepository {
    /// Record a conflict detected at `detected_at`
    fn record(&self, conflict: &NewSyncConflict, detected_at: i64) -> Result<SyncConflict>;

    /// Conflicts not yet dismissed, newest first
    fn list_open(&self) -> Result<Vec<SyncConflict>>;

    /// Every conflict including dismissed ones, newest first
    fn list_all(&self, limit: usize) -> Result<Vec<SyncConflict>>;

    /// Fetch one conflict
    fn get(&self, id: i64) -> Result<Option<SyncConflict>>;

    /// Mark a conflict dismissed. Returns `false` if it already was.
    fn dismiss(&self, id: i64) -> Result<bool>;

    /// Number of open conflicts for an entity
    fn open_count_for(&self, entity_id: &str) -> Result<usize>;
}

/// `SQLite` implementation of `ConflictRepository`
pub struct SqliteConflictRepository<'a> {
    conn: &'a Connection,
}

const SELECT_CONFLICT: &str = "SELECT id, entity_type, entity_id, kind, winner, strategy,
        local_payload, remote_payload, reason, detected_at, dismissed
     FROM sync_conflicts";

struct RawConflict {
    id: i64,
    entity_type: String,
    entity_id: String,
    kind: String,
    winner: String,
    strategy: String,
    local_payload: String,
    remote_payload: Option<String>,
    reason: Option<String>,
    detected_at: i64,
    dismissed: bool,
}

impl<'a> SqliteConflictRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawConflict> {
        Ok(RawConflict {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            kind: row.get(3)?,
            winner: row.get(4)?,
            strategy: row.get(5)?,
            local_payload: row.get(6)?,
            remote_payload: row.get(7)?,
            reason: row.get(8)?,
            detected_at: row.get(9)?,
            dismissed: row.get::<_, i32>(10)? != 0,
        })
    }

    fn payload(id: i64, json: &str) -> Result<LedgerPayload> {
        serde_json::from_str(json).map_err(|error| {
            Error::CorruptState(format!("conflict {id} has unreadable payload: {error}"))
        })
    }

    fn decode(raw: RawConflict) -> Result<SyncConflict> {
        Ok(SyncConflict {
            id: raw.id,
            entity_type: raw.entity_type.parse()?,
            entity_id: raw.entity_id,
            kind: raw.kind.parse()?,
            winner: raw.winner.parse()?,
            strategy: raw.strategy,
            local_payload: Self::payload(raw.id, &raw.local_payload)?,
            remote_payload: raw
                .remote_payload
                .as_deref()
                .map(|json| Self::payload(raw.id, json))
                .transpose()?,
            reason: raw.reason,
            detected_at: raw.detected_at,
            dismissed: raw.dismissed,
        })
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<SyncConflict>> {
        let mut stmt = self.conn.prepare(sql)?;
        let raw = stmt
            .query_map(params, Self::parse_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(Self::decode).collect()
    }
}

impl ConflictRepository for SqliteConflictRepository<'_> {
    fn record(&self, conflict: &NewSyncConflict, detected_at: i64) -> Result<SyncConflict> {
        let local = serde_json::to_string(&conflict.local_payload)?;
        let remote = conflict
            .remote_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.execute(
            "INSERT INTO sync_conflicts (
                entity_type, entity_id, kind, winner, strategy,
                local_payload, remote_payload, reason, detected_at, dismissed
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
            params![
                conflict.entity_type().as_str(),
                conflict.entity_id(),
                conflict.kind.as_str(),
                conflict.winner.as_str(),
                PRIORITY_THEN_RECENCY,
                local,
                remote,
                conflict.reason,
                detected_at
            ],
        )?;

        Ok(SyncConflict {
            id: self.conn.last_insert_rowid(),
            entity_type: conflict.entity_type(),
            entity_id: conflict.entity_id(),
            kind: conflict.kind,
            winner: conflict.winner,
            strategy: PRIORITY_THEN_RECENCY.to_string(),
            local_payload: conflict.local_payload.clone(),
            remote_payload: conflict.remote_payload.clone(),
            reason: conflict.reason.clone(),
            detected_at,
            dismissed: false,
        })
    }

    fn list_open(&self) -> Result<Vec<SyncConflict>> {
        self.query(
            &format!("{SELECT_CONFLICT} WHERE dismissed = 0 ORDER BY detected_at DESC, id DESC"),
            [],
        )
    }

    #[allow(clippy::cast_possible_wrap)]
    fn list_all(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        self.query(
            &format!("{SELECT_CONFLICT} ORDER BY detected_at DESC, id DESC LIMIT ?"),
            params![limit as i64],
        )
    }

    fn get(&self, id: i64) -> Result<Option<SyncConflict>> {
        let raw = self
            .conn
            .query_row(
                &format!("{SELECT_CONFLICT} WHERE id = ?"),
                params![id],
                Self::parse_row,
            )
            .optional()?;
        raw.map(Self::decode).transpose()
    }

    fn dismiss(&self, id: i64) -> Result<bool> {
        if self.get(id)?.is_none() {
            return Err(Error::NotFound(format!("conflict {id}")));
        }
        let rows = self.conn.execute(
            "UPDATE sync_conflicts SET dismissed = 1 WHERE id = ? AND dismissed = 0",
            params![id],
        )?;
        Ok(rows > 0)
    }

    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    fn open_count_for(&self, entity_id: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sync_conflicts WHERE entity_id = ? AND dismissed = 0",
            params![entity_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
