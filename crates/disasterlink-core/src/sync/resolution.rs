//! Priority-then-recency conflict policy.

use std::cmp::Ordering;

use crate::models::{LedgerEntry, LedgerPayload, Winner};

/// Decide which side of a version conflict survives.
///
/// Alerts compare priority first. Equal priorities, and messages, fall back
/// to recency: the remote wins when it changed after the local entry was
/// made, otherwise the local entry wins.
pub fn resolve(local: &LedgerEntry, remote: &LedgerPayload, remote_updated_at: i64) -> Winner {
    if let (LedgerPayload::Alert(mine), LedgerPayload::Alert(theirs)) = (&local.payload, remote) {
        match mine.priority.cmp(&theirs.priority) {
            Ordering::Greater => return Winner::Local,
            Ordering::Less => return Winner::Remote,
            Ordering::Equal => {}
        }
    }
    by_recency(local.created_at, remote_updated_at)
}

const fn by_recency(local_created_at: i64, remote_updated_at: i64) -> Winner {
    if remote_updated_at > local_created_at {
        Winner::Remote
    } else {
        Winner::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertRecord, Location, OpKind, Priority, QueuedMessage};

    fn entry(payload: LedgerPayload, created_at: i64) -> LedgerEntry {
        LedgerEntry {
            sequence: 1,
            entity_type: payload.entity_type(),
            entity_id: payload.entity_id(),
            payload,
            op_kind: OpKind::Update,
            created_at,
            applied_at: None,
        }
    }

    fn alert(priority: Priority) -> AlertRecord {
        AlertRecord::new("Need evacuation", Location::new(0.0, 0.0), priority)
    }

    #[test]
    fn higher_priority_wins_regardless_of_time() {
        let base = alert(Priority::High);
        let mut critical = base.clone();
        critical.priority = Priority::Critical;

        // Local high, remote critical: remote wins even if older
        let local = entry(LedgerPayload::Alert(base.clone()), 100);
        assert_eq!(
            resolve(&local, &LedgerPayload::Alert(critical.clone()), 1),
            Winner::Remote
        );

        // Local critical, remote high: local wins even if remote is newer
        let local = entry(LedgerPayload::Alert(critical), 1);
        assert_eq!(
            resolve(&local, &LedgerPayload::Alert(base), 100),
            Winner::Local
        );
    }

    #[test]
    fn equal_priority_falls_back_to_recency() {
        let record = alert(Priority::Medium);
        let local = entry(LedgerPayload::Alert(record.clone()), 50);

        assert_eq!(
            resolve(&local, &LedgerPayload::Alert(record.clone()), 51),
            Winner::Remote
        );
        assert_eq!(
            resolve(&local, &LedgerPayload::Alert(record.clone()), 50),
            Winner::Local
        );
        assert_eq!(
            resolve(&local, &LedgerPayload::Alert(record), 10),
            Winner::Local
        );
    }

    #[test]
    fn messages_use_recency_only() {
        let message = QueuedMessage::new("dad", "ok");
        let local = entry(LedgerPayload::Message(message.clone()), 20);
        assert_eq!(
            resolve(&local, &LedgerPayload::Message(message.clone()), 30),
            Winner::Remote
        );
        assert_eq!(
            resolve(&local, &LedgerPayload::Message(message), 10),
            Winner::Local
        );
    }
}
