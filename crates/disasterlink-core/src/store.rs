//! In-memory alert and message view read by the UI.
//!
//! Reads never await and never touch the network. Writers replace whole
//! records; listeners are notified after the lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use crate::models::{
    AlertId, AlertRecord, LedgerPayload, MessageId, QueuedMessage, SyncConflict, SyncState,
};
use crate::state::EngineStatus;

/// A change listeners are told about
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    Alert(AlertRecord),
    Message(QueuedMessage),
    ConflictRecorded(SyncConflict),
    ConflictDismissed(i64),
    Status(EngineStatus),
}

type Listener = Arc<dyn Fn(&StateChange) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

#[derive(Default)]
struct View {
    alerts: HashMap<AlertId, AlertRecord>,
    messages: HashMap<MessageId, QueuedMessage>,
    conflicts: Vec<SyncConflict>,
    status: Option<EngineStatus>,
}

/// Single source of truth for the UI
pub struct StateStore {
    view: RwLock<View>,
    listeners: Arc<Mutex<Listeners>>,
}

/// Handle returned by [`StateStore::on_state_change`]; dropping it unsubscribes
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    /// Stop receiving changes
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entries
                .retain(|(id, _)| *id != self.id);
        }
    }
}

impl StateStore {
    /// Build the view from persisted records
    pub fn new(
        alerts: Vec<AlertRecord>,
        messages: Vec<QueuedMessage>,
        conflicts: Vec<SyncConflict>,
    ) -> Self {
        let view = View {
            alerts: alerts.into_iter().map(|alert| (alert.id, alert)).collect(),
            messages: messages
                .into_iter()
                .map(|message| (message.id, message))
                .collect(),
            conflicts,
            status: None,
        };
        Self {
            view: RwLock::new(view),
            listeners: Arc::new(Mutex::new(Listeners::default())),
        }
    }

    /// Register a listener for every subsequent change
    pub fn on_state_change(
        &self,
        listener: impl Fn(&StateChange) + Send + Sync + 'static,
    ) -> Subscription {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.entries.push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    fn notify(&self, change: &StateChange) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(change);
        }
    }

    fn write(&self, update: impl FnOnce(&mut View) -> Option<StateChange>) {
        let change = {
            let mut view = self.view.write().unwrap_or_else(PoisonError::into_inner);
            update(&mut view)
        };
        if let Some(change) = change {
            self.notify(&change);
        }
    }

    /// Optimistic local mutation; the entity becomes `Pending`.
    ///
    /// An entity with an open conflict keeps showing `Conflict`.
    pub fn apply_local(&self, mut payload: LedgerPayload) {
        self.write(|view| {
            match &mut payload {
                LedgerPayload::Alert(alert) => {
                    let previous = view.alerts.get(&alert.id);
                    alert.remote_version = previous.and_then(|p| p.remote_version);
                    alert.sync_state = local_state(previous.map(|p| p.sync_state));
                }
                LedgerPayload::Message(message) => {
                    let previous = view.messages.get(&message.id);
                    message.remote_version = previous.and_then(|p| p.remote_version);
                    message.sync_state = local_state(previous.map(|p| p.sync_state));
                }
            }
            Some(Self::put(view, payload))
        });
    }

    /// Authoritative overwrite with the bookkeeping the record carries
    pub fn reconcile(&self, payload: LedgerPayload) {
        self.write(|view| Some(Self::put(view, payload)));
    }

    fn put(view: &mut View, payload: LedgerPayload) -> StateChange {
        match payload {
            LedgerPayload::Alert(alert) => {
                view.alerts.insert(alert.id, alert.clone());
                StateChange::Alert(alert)
            }
            LedgerPayload::Message(message) => {
                view.messages.insert(message.id, message.clone());
                StateChange::Message(message)
            }
        }
    }

    /// Surface a conflict for manual resolution
    pub fn record_conflict(&self, conflict: SyncConflict) {
        self.write(|view| {
            view.conflicts.retain(|existing| existing.id != conflict.id);
            view.conflicts.insert(0, conflict.clone());
            Some(StateChange::ConflictRecorded(conflict))
        });
    }

    /// Drop a dismissed conflict from the view
    pub fn dismiss_conflict(&self, id: i64) {
        self.write(|view| {
            let before = view.conflicts.len();
            view.conflicts.retain(|conflict| conflict.id != id);
            (view.conflicts.len() != before).then_some(StateChange::ConflictDismissed(id))
        });
    }

    /// Change the banner status; degraded is sticky
    pub fn set_status(&self, status: EngineStatus) {
        self.write(|view| {
            if view.status.as_ref() == Some(&status)
                || view.status.as_ref().is_some_and(EngineStatus::is_degraded)
            {
                return None;
            }
            view.status = Some(status.clone());
            Some(StateChange::Status(status))
        });
    }

    /// Current banner status
    pub fn status(&self) -> EngineStatus {
        self.read(|view| view.status.clone().unwrap_or(EngineStatus::Offline))
    }

    fn read<T>(&self, f: impl FnOnce(&View) -> T) -> T {
        let view = self.view.read().unwrap_or_else(PoisonError::into_inner);
        f(&view)
    }

    /// All alerts, newest first
    pub fn list_alerts(&self) -> Vec<AlertRecord> {
        let mut alerts: Vec<_> = self.read(|view| view.alerts.values().cloned().collect());
        alerts.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        alerts
    }

    pub fn get_alert(&self, id: &AlertId) -> Option<AlertRecord> {
        self.read(|view| view.alerts.get(id).cloned())
    }

    /// All queued messages, newest first
    pub fn list_messages(&self) -> Vec<QueuedMessage> {
        let mut messages: Vec<_> = self.read(|view| view.messages.values().cloned().collect());
        messages.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        messages
    }

    pub fn get_message(&self, id: &MessageId) -> Option<QueuedMessage> {
        self.read(|view| view.messages.get(id).cloned())
    }

    /// Open conflicts, newest first
    pub fn list_conflicts(&self) -> Vec<SyncConflict> {
        self.read(|view| view.conflicts.clone())
    }

}

const fn local_state(previous: Option<SyncState>) -> SyncState {
    match previous {
        Some(SyncState::Conflict) => SyncState::Conflict,
        _ => SyncState::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConflictKind, EntityType, Location, Priority, Winner};
    use pretty_assertions::assert_eq;

    fn alert(message: &str, created_at: i64) -> AlertRecord {
        let mut alert = AlertRecord::new(message, Location::new(0.0, 0.0), Priority::High);
        alert.created_at = created_at;
        alert
    }

    fn empty() -> StateStore {
        StateStore::new(Vec::new(), Vec::new(), Vec::new())
    }

    #[test]
    fn list_alerts_is_newest_first() {
        let store = empty();
        store.apply_local(LedgerPayload::Alert(alert("old", 1)));
        store.apply_local(LedgerPayload::Alert(alert("new", 3)));
        store.apply_local(LedgerPayload::Alert(alert("mid", 2)));

        let order: Vec<_> = store
            .list_alerts()
            .into_iter()
            .map(|alert| alert.message)
            .collect();
        assert_eq!(order, vec!["new", "mid", "old"]);
    }

    #[test]
    fn apply_local_marks_pending_and_keeps_remote_version() {
        let store = empty();
        let mut synced = alert("synced", 1);
        synced.sync_state = SyncState::Synced;
        synced.remote_version = Some(5);
        store.reconcile(LedgerPayload::Alert(synced.clone()));

        let mut edited = synced.clone();
        edited.sync_state = SyncState::Synced;
        edited.remote_version = None;
        edited.resolve(9).unwrap();
        store.apply_local(LedgerPayload::Alert(edited));

        let current = store.get_alert(&synced.id).unwrap();
        assert_eq!(current.sync_state, SyncState::Pending);
        assert_eq!(current.remote_version, Some(5));
        assert_eq!(current.resolved_at, Some(9));
    }

    #[test]
    fn listeners_see_changes_until_unsubscribed() {
        let store = empty();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = store.on_state_change(move |change| {
            sink.lock().unwrap().push(change.clone());
        });

        let first = alert("first", 1);
        store.apply_local(LedgerPayload::Alert(first.clone()));
        subscription.unsubscribe();
        store.apply_local(LedgerPayload::Alert(alert("second", 2)));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], StateChange::Alert(alert) if alert.id == first.id));
    }

    #[test]
    fn degraded_status_is_sticky() {
        let store = empty();
        assert_eq!(store.status(), EngineStatus::Offline);
        store.set_status(EngineStatus::Idle);
        store.set_status(EngineStatus::Degraded("disk full".to_string()));
        store.set_status(EngineStatus::Idle);
        assert!(store.status().is_degraded());
    }

    #[test]
    fn conflicts_are_listed_newest_first_and_dismissable() {
        let store = empty();
        let local = alert("local", 1);
        let conflict = |id| SyncConflict {
            id,
            entity_type: EntityType::Alert,
            entity_id: local.id.as_str(),
            kind: ConflictKind::Version,
            winner: Winner::Remote,
            strategy: crate::models::PRIORITY_THEN_RECENCY.to_string(),
            local_payload: LedgerPayload::Alert(local.clone()),
            remote_payload: None,
            reason: None,
            detected_at: id,
            dismissed: false,
        };
        store.record_conflict(conflict(1));
        store.record_conflict(conflict(2));

        let ids: Vec<_> = store.list_conflicts().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![2, 1]);

        store.dismiss_conflict(2);
        assert_eq!(store.list_conflicts().len(), 1);
    }
}
