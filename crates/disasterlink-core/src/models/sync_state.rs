//! Per-entity sync state

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where an entity sits in the optimistic -> authoritative state machine.
///
/// `Pending` until the reconciler hears back from the remote authority, then
/// `Synced`, or `Conflict` when a conflict or rejection was surfaced for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Pending,
    Synced,
    Conflict,
}

impl SyncState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Conflict => "conflict",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "conflict" => Ok(Self::Conflict),
            other => Err(format!("unknown sync state: {other}")),
        }
    }
}
