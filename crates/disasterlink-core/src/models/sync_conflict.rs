//! Sync conflict model

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{EntityType, LedgerPayload};
use crate::error::Error;

/// Name recorded for the automatic resolution policy
pub const PRIORITY_THEN_RECENCY: &str = "priority-then-recency";

/// Why the entity needs the user's attention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictKind {
    /// The remote held a newer authoritative update
    Version,
    /// The remote refused the record permanently
    Rejected,
}

impl ConflictKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Version => "version",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for ConflictKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "version" => Ok(Self::Version),
            "rejected" => Ok(Self::Rejected),
            other => Err(Error::CorruptState(format!("unknown conflict kind: {other}"))),
        }
    }
}

/// Which side's record the automatic resolution kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Local,
    Remote,
}

impl Winner {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl FromStr for Winner {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(Error::CorruptState(format!("unknown conflict winner: {other}"))),
        }
    }
}

/// Recorded sync conflict, kept until the user dismisses it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub kind: ConflictKind,
    pub winner: Winner,
    /// Resolution strategy name
    pub strategy: String,
    /// Local snapshot that was pushed
    pub local_payload: LedgerPayload,
    /// Remote snapshot that competed with it, if any
    pub remote_payload: Option<LedgerPayload>,
    /// Rejection reason from the remote authority
    pub reason: Option<String>,
    /// Detection timestamp (Unix ms)
    pub detected_at: i64,
    pub dismissed: bool,
}

/// Conflict details before they receive a row id
#[derive(Debug, Clone, PartialEq)]
pub struct NewSyncConflict {
    pub kind: ConflictKind,
    pub winner: Winner,
    pub local_payload: LedgerPayload,
    pub remote_payload: Option<LedgerPayload>,
    pub reason: Option<String>,
}

impl NewSyncConflict {
    pub fn entity_type(&self) -> EntityType {
        self.local_payload.entity_type()
    }

    pub fn entity_id(&self) -> String {
        self.local_payload.entity_id()
    }
}
