//! Ledger entry model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{AlertRecord, QueuedMessage};
use crate::error::Error;

/// Kind of entity a ledger entry refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Alert,
    Message,
}

impl EntityType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Alert => "alert",
            Self::Message => "message",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alert" => Ok(Self::Alert),
            "message" => Ok(Self::Message),
            other => Err(Error::CorruptState(format!("unknown entity type: {other}"))),
        }
    }
}

/// Whether the mutation created the entity or changed an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Create,
    Update,
}

impl OpKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
        }
    }
}

impl FromStr for OpKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            other => Err(Error::CorruptState(format!("unknown op kind: {other}"))),
        }
    }
}

/// Full snapshot of the entity after the local mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "record", rename_all = "lowercase")]
pub enum LedgerPayload {
    Alert(AlertRecord),
    Message(QueuedMessage),
}

impl LedgerPayload {
    pub const fn entity_type(&self) -> EntityType {
        match self {
            Self::Alert(_) => EntityType::Alert,
            Self::Message(_) => EntityType::Message,
        }
    }

    pub fn entity_id(&self) -> String {
        match self {
            Self::Alert(alert) => alert.id.as_str(),
            Self::Message(message) => message.id.as_str(),
        }
    }
}

/// One local mutation awaiting acknowledgment from the remote authority.
///
/// Entries are immutable once written; a later change to the same entity
/// appends a new entry with a higher sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Monotonically increasing per device
    pub sequence: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub payload: LedgerPayload,
    pub op_kind: OpKind,
    /// When the mutation was made (Unix ms)
    pub created_at: i64,
    /// When the reconciler last tried to push it (Unix ms)
    pub applied_at: Option<i64>,
}
