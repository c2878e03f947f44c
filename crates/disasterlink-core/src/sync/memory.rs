//! In-process remote authority.
//!
//! Backs the reference server and the sync tests. Versions come from one
//! revision counter, so they also serve as the `alerts/since` cursor.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::remote::{AlertPage, PushOutcome, PushRequest, RemoteAuthority, Versioned};
use crate::error::{Error, Result};
use crate::models::{AlertId, AlertRecord, MessageId, MessageStatus, QueuedMessage};
use crate::util::unix_millis_now;

struct Inner {
    revision: i64,
    alerts: HashMap<AlertId, Versioned<AlertRecord>>,
    messages: HashMap<MessageId, Versioned<QueuedMessage>>,
    reachable: bool,
    rejections: VecDeque<String>,
    dropped_acks: usize,
    latency: Option<Duration>,
    pushes: usize,
}

/// Remote authority held in memory, with fault injection
pub struct InMemoryAuthority {
    inner: Mutex<Inner>,
}

impl Default for InMemoryAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAuthority {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                revision: 0,
                alerts: HashMap::new(),
                messages: HashMap::new(),
                reachable: true,
                rejections: VecDeque::new(),
                dropped_acks: 0,
                latency: None,
                pushes: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// While unreachable every call fails with `NetworkUnavailable`
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Refuse the next push with `reason`
    pub fn reject_next(&self, reason: impl Into<String>) {
        self.lock().rejections.push_back(reason.into());
    }

    /// Store the next push but lose its acknowledgement
    pub fn drop_next_ack(&self) {
        self.lock().dropped_acks += 1;
    }

    /// Delay every call by `latency` before it is applied
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Pushes that reached the authority, including refused ones
    pub fn push_count(&self) -> usize {
        self.lock().pushes
    }

    pub fn alert_count(&self) -> usize {
        self.lock().alerts.len()
    }

    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn get_alert(&self, id: &AlertId) -> Option<Versioned<AlertRecord>> {
        self.lock().alerts.get(id).cloned()
    }

    pub fn get_message(&self, id: &MessageId) -> Option<Versioned<QueuedMessage>> {
        self.lock().messages.get(id).cloned()
    }

    /// Change an alert on the authority's side, as another device would
    pub fn remote_update_alert(&self, alert: AlertRecord, updated_at: i64) -> Versioned<AlertRecord> {
        let mut inner = self.lock();
        inner.revision += 1;
        let stored = Versioned {
            record: alert,
            version: inner.revision,
            updated_at,
        };
        inner.alerts.insert(stored.record.id, stored.clone());
        stored
    }

    /// Apply an alert push without simulated latency
    pub fn apply_alert(&self, request: PushRequest<AlertRecord>) -> Result<PushOutcome<AlertRecord>> {
        request
            .record
            .validate()
            .map_err(|error| Error::RemoteRejected(error.to_string()))?;

        let mut inner = self.lock();
        inner.admit()?;
        let id = request.record.id;
        let now = unix_millis_now();
        let outcome = match inner.alerts.get(&id).cloned() {
            Some(current) if current.record.same_content(&request.record) => {
                PushOutcome::Accepted(current)
            }
            Some(current) if request.base_version != Some(current.version) => {
                PushOutcome::Conflict(current)
            }
            _ => {
                inner.revision += 1;
                let stored = Versioned {
                    record: request.record,
                    version: inner.revision,
                    updated_at: now,
                };
                inner.alerts.insert(id, stored.clone());
                PushOutcome::Accepted(stored)
            }
        };
        inner.acknowledge(outcome)
    }

    /// Apply a message push without simulated latency. Stored messages are sent.
    pub fn apply_message(
        &self,
        request: PushRequest<QueuedMessage>,
    ) -> Result<PushOutcome<QueuedMessage>> {
        if request.record.recipient.trim().is_empty() || request.record.body.trim().is_empty() {
            return Err(Error::RemoteRejected(
                "message needs a recipient and a body".to_string(),
            ));
        }

        let mut inner = self.lock();
        inner.admit()?;
        let id = request.record.id;
        let now = unix_millis_now();
        let outcome = match inner.messages.get(&id).cloned() {
            Some(current) if current.record.same_content(&request.record) => {
                PushOutcome::Accepted(current)
            }
            Some(current) if request.base_version != Some(current.version) => {
                PushOutcome::Conflict(current)
            }
            _ => {
                let mut record = request.record;
                if record.status != MessageStatus::Sent {
                    record.mark_sent(now);
                }
                inner.revision += 1;
                let stored = Versioned {
                    record,
                    version: inner.revision,
                    updated_at: now,
                };
                inner.messages.insert(id, stored.clone());
                PushOutcome::Accepted(stored)
            }
        };
        inner.acknowledge(outcome)
    }

    /// Alerts with a version after `cursor`, oldest first
    pub fn changes_since(&self, cursor: Option<&str>, limit: usize) -> Result<AlertPage> {
        let after = match cursor {
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map_err(|_| Error::RemoteRejected(format!("invalid cursor: {raw}")))?,
            None => 0,
        };

        let inner = self.lock();
        if !inner.reachable {
            return Err(unreachable());
        }
        let mut records: Vec<_> = inner
            .alerts
            .values()
            .filter(|stored| stored.version > after)
            .cloned()
            .collect();
        records.sort_by_key(|stored| stored.version);
        records.truncate(limit.max(1));

        let cursor = records
            .last()
            .map(|stored| stored.version.to_string())
            .or_else(|| cursor.map(ToString::to_string));
        Ok(AlertPage { records, cursor })
    }

    fn latency(&self) -> Option<Duration> {
        self.lock().latency
    }
}

impl Inner {
    fn admit(&mut self) -> Result<()> {
        if !self.reachable {
            return Err(unreachable());
        }
        self.pushes += 1;
        match self.rejections.pop_front() {
            Some(reason) => Err(Error::RemoteRejected(reason)),
            None => Ok(()),
        }
    }

    fn acknowledge<T>(&mut self, outcome: PushOutcome<T>) -> Result<PushOutcome<T>> {
        if self.dropped_acks > 0 {
            self.dropped_acks -= 1;
            return Err(Error::NetworkUnavailable(
                "connection reset before acknowledgement".to_string(),
            ));
        }
        Ok(outcome)
    }
}

fn unreachable() -> Error {
    Error::NetworkUnavailable("remote authority unreachable".to_string())
}

impl RemoteAuthority for InMemoryAuthority {
    async fn put_alert(
        &self,
        request: PushRequest<AlertRecord>,
    ) -> Result<PushOutcome<AlertRecord>> {
        if let Some(latency) = self.latency() {
            tokio::time::sleep(latency).await;
        }
        self.apply_alert(request)
    }

    async fn put_message(
        &self,
        request: PushRequest<QueuedMessage>,
    ) -> Result<PushOutcome<QueuedMessage>> {
        if let Some(latency) = self.latency() {
            tokio::time::sleep(latency).await;
        }
        self.apply_message(request)
    }

    async fn alerts_since(&self, cursor: Option<String>, limit: usize) -> Result<AlertPage> {
        if let Some(latency) = self.latency() {
            tokio::time::sleep(latency).await;
        }
        self.changes_since(cursor.as_deref(), limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Location, Priority};
    use crate::sync::remote::CausalStamp;

    fn request<T>(record: T, base_version: Option<i64>) -> PushRequest<T> {
        PushRequest {
            record,
            base_version,
            causal_stamp: CausalStamp {
                sequence: 1,
                issued_at: 0,
            },
        }
    }

    fn alert() -> AlertRecord {
        AlertRecord::new("Bridge flooded", Location::new(1.0, 2.0), Priority::High)
    }

    #[test]
    fn first_push_is_stored() {
        let authority = InMemoryAuthority::new();
        let alert = alert();
        let PushOutcome::Accepted(stored) = authority.apply_alert(request(alert.clone(), None)).unwrap()
        else {
            panic!("expected accept");
        };
        assert_eq!(stored.version, 1);
        assert!(stored.record.same_content(&alert));
        assert_eq!(authority.alert_count(), 1);
    }

    #[test]
    fn duplicate_push_is_idempotent() {
        let authority = InMemoryAuthority::new();
        let alert = alert();
        authority.apply_alert(request(alert.clone(), None)).unwrap();
        let outcome = authority.apply_alert(request(alert, None)).unwrap();
        assert!(matches!(outcome, PushOutcome::Accepted(ref stored) if stored.version == 1));
        assert_eq!(authority.alert_count(), 1);
    }

    #[test]
    fn stale_base_version_conflicts() {
        let authority = InMemoryAuthority::new();
        let mut alert = alert();
        authority.apply_alert(request(alert.clone(), None)).unwrap();

        let mut remote = alert.clone();
        remote.priority = Priority::Critical;
        authority.remote_update_alert(remote, 10);

        alert.resolve(5).unwrap();
        let outcome = authority.apply_alert(request(alert.clone(), Some(1))).unwrap();
        assert!(matches!(outcome, PushOutcome::Conflict(ref stored) if stored.version == 2));

        let outcome = authority.apply_alert(request(alert, Some(2))).unwrap();
        assert!(matches!(outcome, PushOutcome::Accepted(ref stored) if stored.version == 3));
    }

    #[test]
    fn messages_are_marked_sent() {
        let authority = InMemoryAuthority::new();
        let message = QueuedMessage::new("dad", "At the school gym");
        let PushOutcome::Accepted(stored) = authority.apply_message(request(message, None)).unwrap()
        else {
            panic!("expected accept");
        };
        assert_eq!(stored.record.status, MessageStatus::Sent);
        assert!(stored.record.sent_at.is_some());
    }

    #[test]
    fn injected_faults() {
        let authority = InMemoryAuthority::new();
        authority.reject_next("quota exceeded");
        assert!(matches!(
            authority.apply_alert(request(alert(), None)),
            Err(Error::RemoteRejected(reason)) if reason == "quota exceeded"
        ));

        authority.set_reachable(false);
        assert!(matches!(
            authority.apply_alert(request(alert(), None)),
            Err(Error::NetworkUnavailable(_))
        ));
        assert!(authority.changes_since(None, 10).is_err());
        authority.set_reachable(true);

        authority.drop_next_ack();
        assert!(matches!(
            authority.apply_alert(request(alert(), None)),
            Err(Error::NetworkUnavailable(_))
        ));
        // Applied even though the caller never heard back
        assert_eq!(authority.alert_count(), 1);
        assert_eq!(authority.push_count(), 2);
    }

    #[test]
    fn invalid_records_are_rejected() {
        let authority = InMemoryAuthority::new();
        let mut alert = alert();
        alert.message = "  ".to_string();
        assert!(matches!(
            authority.apply_alert(request(alert, None)),
            Err(Error::RemoteRejected(_))
        ));
        assert_eq!(authority.push_count(), 0);
    }

    #[test]
    fn changes_since_pages_by_version() {
        let authority = InMemoryAuthority::new();
        for _ in 0..3 {
            authority.apply_alert(request(alert(), None)).unwrap();
        }

        let first = authority.changes_since(None, 2).unwrap();
        assert_eq!(first.records.len(), 2);
        assert_eq!(first.cursor.as_deref(), Some("2"));

        let second = authority.changes_since(first.cursor.as_deref(), 2).unwrap();
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.cursor.as_deref(), Some("3"));

        let empty = authority.changes_since(Some("3"), 2).unwrap();
        assert!(empty.records.is_empty());
        assert_eq!(empty.cursor.as_deref(), Some("3"));

        assert!(authority.changes_since(Some("abc"), 2).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn latency_delays_application() {
        let authority = std::sync::Arc::new(InMemoryAuthority::new());
        authority.set_latency(Some(Duration::from_secs(30)));
        let alert = alert();

        let pending = {
            let authority = authority.clone();
            tokio::spawn(async move { authority.put_alert(request(alert, None)).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(authority.alert_count(), 0);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(pending.await.unwrap().is_ok());
        assert_eq!(authority.alert_count(), 1);
    }
}
