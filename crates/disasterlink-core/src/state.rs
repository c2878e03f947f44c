//! Engine status shown by the offline/online banner.

use serde::{Deserialize, Serialize};

/// Coarse engine status for the UI banner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum EngineStatus {
    /// No connectivity; mutations are queued in the ledger.
    Offline,
    /// Online with no drain running.
    Idle,
    /// A drain is in flight.
    Syncing,
    /// Local storage failed; the UI should show the degraded-mode banner.
    Degraded(String),
}

impl EngineStatus {
    pub const fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(_))
    }

    pub fn label(&self) -> String {
        match self {
            Self::Offline => "offline".to_string(),
            Self::Idle => "online".to_string(),
            Self::Syncing => "syncing".to_string(),
            Self::Degraded(reason) => format!("degraded ({reason})"),
        }
    }
}
