//! Data models for DisasterLink

mod alert;
mod id;
mod ledger;
mod message;
mod sync_conflict;
mod sync_state;

pub use alert::{AlertRecord, AlertStatus, Location, Priority};
pub use id::{AlertId, MessageId};
pub use ledger::{EntityType, LedgerEntry, LedgerPayload, OpKind};
pub use message::{MessageStatus, QueuedMessage};
pub use sync_conflict::{
    ConflictKind, NewSyncConflict, SyncConflict, Winner, PRIORITY_THEN_RECENCY,
};
pub use sync_state::SyncState;
