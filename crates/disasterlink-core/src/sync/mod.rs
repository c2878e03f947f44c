//! Sync reconciler.
//!
//! Drains the local ledger against a [`RemoteAuthority`] in sequence order,
//! settles each answer in one local transaction, then pulls alerts other
//! devices changed. Only one drain runs at a time.

mod http;
mod memory;
mod remote;
mod resolution;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub use http::HttpRemote;
pub use memory::InMemoryAuthority;
pub use remote::{
    AlertPage, CausalStamp, PushOutcome, PushRequest, RemoteAuthority, Versioned,
};
pub use resolution::resolve;

use crate::error::{Error, Result};
use crate::models::{
    ConflictKind, EntityType, LedgerEntry, LedgerPayload, MessageStatus, NewSyncConflict,
    QueuedMessage, Winner,
};
use crate::services::{Acknowledgment, LocalStore, Settled, Settlement};
use crate::shutdown::ShutdownSignal;
use crate::store::StateStore;
use crate::util::unix_millis_now;

/// Per-call limit on a remote request
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(10);
/// Alerts requested per `alerts/since` call
pub const DEFAULT_PULL_PAGE_SIZE: usize = 100;

const LEDGER_PAGE_SIZE: usize = 64;

/// Counters for one drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainResult {
    /// Entries the authority accepted without a conflict
    pub pushed: usize,
    /// Entries that hit a version conflict
    pub conflicted: usize,
    /// Entries the authority refused for good
    pub rejected: usize,
    /// Entries left pending after a transient failure
    pub failed: usize,
    /// Remote alert changes applied locally
    pub pulled: usize,
    /// Stopped early by a network failure or shutdown
    pub interrupted: bool,
}

impl DrainResult {
    /// Every entry got a definitive answer and the pull completed
    pub const fn is_success(&self) -> bool {
        self.failed == 0 && !self.interrupted
    }
}

/// What happened to one ledger entry
enum Step {
    Pushed,
    /// `skip_entity` drops the entity's remaining entries from this drain
    Conflicted { skip_entity: bool },
    Rejected,
    Unreachable,
}

pub struct Reconciler<R> {
    local: LocalStore,
    state: Arc<StateStore>,
    remote: Arc<R>,
    push_timeout: Duration,
    pull_page_size: usize,
    gate: tokio::sync::Mutex<()>,
}

impl<R: RemoteAuthority> Reconciler<R> {
    pub fn new(local: LocalStore, state: Arc<StateStore>, remote: Arc<R>) -> Self {
        Self {
            local,
            state,
            remote,
            push_timeout: DEFAULT_PUSH_TIMEOUT,
            pull_page_size: DEFAULT_PULL_PAGE_SIZE,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_push_timeout(mut self, push_timeout: Duration) -> Self {
        self.push_timeout = push_timeout;
        self
    }

    #[must_use]
    pub fn with_pull_page_size(mut self, pull_page_size: usize) -> Self {
        self.pull_page_size = pull_page_size.max(1);
        self
    }

    pub const fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Push every pending entry, then pull remote changes.
    ///
    /// A network failure stops the drain and leaves the rest of the ledger
    /// pending. Local storage failures are returned as errors.
    pub async fn drain(&self, shutdown: &ShutdownSignal) -> Result<DrainResult> {
        let _drain = self.gate.lock().await;
        let mut result = DrainResult::default();
        let mut skipped: HashSet<String> = HashSet::new();
        let mut after = 0;

        'push: loop {
            let page = self.local.pending_page(after, LEDGER_PAGE_SIZE).await?;
            if page.is_empty() {
                break;
            }

            for entry in page {
                after = entry.sequence;
                if shutdown.is_triggered() {
                    result.interrupted = true;
                    break 'push;
                }
                if skipped.contains(&entry.entity_id) {
                    continue;
                }

                match self.push_entry(&entry).await? {
                    Step::Pushed => result.pushed += 1,
                    Step::Conflicted { skip_entity } => {
                        result.conflicted += 1;
                        if skip_entity {
                            skipped.insert(entry.entity_id.clone());
                        }
                    }
                    Step::Rejected => result.rejected += 1,
                    Step::Unreachable => {
                        result.failed += 1;
                        result.interrupted = true;
                        break 'push;
                    }
                }
            }
        }

        if !result.interrupted {
            self.pull(shutdown, &mut result).await?;
        }

        tracing::info!(
            pushed = result.pushed,
            conflicted = result.conflicted,
            rejected = result.rejected,
            failed = result.failed,
            pulled = result.pulled,
            interrupted = result.interrupted,
            "Drain finished"
        );
        Ok(result)
    }

    async fn push_entry(&self, entry: &LedgerEntry) -> Result<Step> {
        self.local
            .mark_attempted(entry.sequence, unix_millis_now())
            .await?;
        let current = self
            .local
            .get_record(entry.entity_type, &entry.entity_id)
            .await?;
        let base_version = current.as_ref().and_then(known_version);

        if entry.entity_type == EntityType::Message {
            self.update_message(&entry.entity_id, QueuedMessage::mark_sending)
                .await?;
        }

        tracing::debug!(
            sequence = entry.sequence,
            entity = %entry.entity_id,
            ?base_version,
            "Pushing {}",
            entry.entity_type
        );

        match self.send(&entry.payload, base_version, entry.sequence).await {
            Ok(PushOutcome::Accepted(stored)) => {
                let record = self.merge_accepted(&entry.entity_id, stored.record).await?;
                self.settle(Settlement {
                    entity_type: entry.entity_type,
                    entity_id: entry.entity_id.clone(),
                    acknowledge: Acknowledgment::Entry(entry.sequence),
                    authoritative: Some(record),
                    remote_version: Some(stored.version),
                    conflict: None,
                })
                .await?;
                Ok(Step::Pushed)
            }
            Ok(PushOutcome::Conflict(current)) => self.resolve_conflict(entry, current).await,
            Err(Error::RemoteRejected(reason)) => {
                self.reject(entry, reason, Acknowledgment::Entry(entry.sequence))
                    .await
            }
            Err(error) if error.is_transient() => self.unreachable(entry, &error).await,
            Err(error) => Err(error),
        }
    }

    async fn resolve_conflict(
        &self,
        entry: &LedgerEntry,
        current: Versioned<LedgerPayload>,
    ) -> Result<Step> {
        // Payloads are full snapshots, so the newest pending one speaks for
        // every local change of the entity
        let latest = self
            .local
            .pending_for_entity(&entry.entity_id)
            .await?
            .pop()
            .filter(|latest| latest.sequence >= entry.sequence)
            .unwrap_or_else(|| entry.clone());
        let through = Acknowledgment::Through(latest.sequence);
        let winner = resolve(&latest, &current.record, current.updated_at);
        tracing::info!(
            entity = %entry.entity_id,
            remote_version = current.version,
            local_sequence = latest.sequence,
            "Version conflict on {}, {} wins",
            entry.entity_type,
            winner.as_str()
        );
        let conflict = |remote: &LedgerPayload| NewSyncConflict {
            kind: ConflictKind::Version,
            winner,
            local_payload: latest.payload.clone(),
            remote_payload: Some(remote.clone()),
            reason: None,
        };

        if winner == Winner::Remote {
            // The remote copy replaces every pending local change of the entity
            self.settle(Settlement {
                entity_type: entry.entity_type,
                entity_id: entry.entity_id.clone(),
                acknowledge: through,
                authoritative: Some(current.record.clone()),
                remote_version: Some(current.version),
                conflict: Some(conflict(&current.record)),
            })
            .await?;
            return Ok(Step::Conflicted { skip_entity: true });
        }

        match self
            .send(&latest.payload, Some(current.version), latest.sequence)
            .await
        {
            Ok(PushOutcome::Accepted(stored)) => {
                let record = self.merge_accepted(&entry.entity_id, stored.record).await?;
                self.settle(Settlement {
                    entity_type: entry.entity_type,
                    entity_id: entry.entity_id.clone(),
                    acknowledge: through,
                    authoritative: Some(record),
                    remote_version: Some(stored.version),
                    conflict: Some(conflict(&current.record)),
                })
                .await?;
                Ok(Step::Conflicted { skip_entity: true })
            }
            Ok(PushOutcome::Conflict(newer)) => {
                // Changed again underneath us; retried on the next drain
                self.settle(Settlement {
                    entity_type: entry.entity_type,
                    entity_id: entry.entity_id.clone(),
                    acknowledge: Acknowledgment::None,
                    authoritative: None,
                    remote_version: Some(newer.version),
                    conflict: Some(conflict(&newer.record)),
                })
                .await?;
                Ok(Step::Conflicted { skip_entity: true })
            }
            Err(Error::RemoteRejected(reason)) => self.reject(&latest, reason, through).await,
            Err(error) if error.is_transient() => {
                self.settle(Settlement {
                    entity_type: entry.entity_type,
                    entity_id: entry.entity_id.clone(),
                    acknowledge: Acknowledgment::None,
                    authoritative: None,
                    remote_version: Some(current.version),
                    conflict: Some(conflict(&current.record)),
                })
                .await?;
                self.unreachable(entry, &error).await
            }
            Err(error) => Err(error),
        }
    }

    async fn reject(
        &self,
        entry: &LedgerEntry,
        reason: String,
        acknowledge: Acknowledgment,
    ) -> Result<Step> {
        tracing::warn!(
            sequence = entry.sequence,
            entity = %entry.entity_id,
            "Remote rejected {}: {reason}",
            entry.entity_type
        );
        if entry.entity_type == EntityType::Message {
            self.update_message(&entry.entity_id, |message| {
                message.record_send_failure(reason.clone());
            })
            .await?;
        }
        self.settle(Settlement {
            entity_type: entry.entity_type,
            entity_id: entry.entity_id.clone(),
            acknowledge,
            authoritative: None,
            remote_version: None,
            conflict: Some(NewSyncConflict {
                kind: ConflictKind::Rejected,
                winner: Winner::Remote,
                local_payload: entry.payload.clone(),
                remote_payload: None,
                reason: Some(reason),
            }),
        })
        .await?;
        Ok(Step::Rejected)
    }

    async fn unreachable(&self, entry: &LedgerEntry, error: &Error) -> Result<Step> {
        tracing::warn!(
            sequence = entry.sequence,
            entity = %entry.entity_id,
            "Push failed, leaving ledger pending: {error}"
        );
        if entry.entity_type == EntityType::Message {
            self.update_message(&entry.entity_id, |message| {
                message.record_send_failure(error.to_string());
            })
            .await?;
        }
        Ok(Step::Unreachable)
    }

    async fn send(
        &self,
        payload: &LedgerPayload,
        base_version: Option<i64>,
        sequence: i64,
    ) -> Result<PushOutcome<LedgerPayload>> {
        let causal_stamp = CausalStamp {
            sequence,
            issued_at: unix_millis_now(),
        };
        let call = async {
            match payload.clone() {
                LedgerPayload::Alert(record) => self
                    .remote
                    .put_alert(PushRequest {
                        record,
                        base_version,
                        causal_stamp,
                    })
                    .await
                    .map(|outcome| outcome.map(LedgerPayload::Alert)),
                LedgerPayload::Message(record) => self
                    .remote
                    .put_message(PushRequest {
                        record,
                        base_version,
                        causal_stamp,
                    })
                    .await
                    .map(|outcome| outcome.map(LedgerPayload::Message)),
            }
        };

        tokio::time::timeout(self.push_timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(Error::NetworkUnavailable(format!(
                    "remote did not answer within {} ms",
                    self.push_timeout.as_millis()
                )))
            })
    }

    /// Keep the local send history on an accepted message
    async fn merge_accepted(
        &self,
        entity_id: &str,
        mut record: LedgerPayload,
    ) -> Result<LedgerPayload> {
        if let LedgerPayload::Message(accepted) = &mut record {
            if let Some(LedgerPayload::Message(local)) =
                self.local.get_record(EntityType::Message, entity_id).await?
            {
                accepted.attempts = accepted.attempts.max(local.attempts);
            }
            if accepted.status != MessageStatus::Sent {
                accepted.mark_sent(unix_millis_now());
            }
        }
        Ok(record)
    }

    /// Change a message's delivery status without touching its sync state
    async fn update_message(
        &self,
        entity_id: &str,
        update: impl FnOnce(&mut QueuedMessage) + Send,
    ) -> Result<()> {
        let Some(LedgerPayload::Message(mut message)) =
            self.local.get_record(EntityType::Message, entity_id).await?
        else {
            return Ok(());
        };
        update(&mut message);
        let record = LedgerPayload::Message(message);
        self.local.store_record(&record).await?;
        self.state.reconcile(record);
        Ok(())
    }

    async fn settle(&self, settlement: Settlement) -> Result<()> {
        let Settled { record, conflict } = self.local.settle(settlement).await?;
        if let Some(record) = record {
            self.state.reconcile(record);
        }
        if let Some(conflict) = conflict {
            self.state.record_conflict(conflict);
        }
        Ok(())
    }

    async fn pull(&self, shutdown: &ShutdownSignal, result: &mut DrainResult) -> Result<()> {
        let mut cursor = self.local.meta().await?.pull_cursor;
        loop {
            if shutdown.is_triggered() {
                result.interrupted = true;
                return Ok(());
            }

            let call = self
                .remote
                .alerts_since(cursor.clone(), self.pull_page_size);
            let page = match tokio::time::timeout(self.push_timeout, call).await {
                Ok(Ok(page)) => page,
                Ok(Err(error)) if error.is_transient() => {
                    tracing::warn!("Pull failed: {error}");
                    result.interrupted = true;
                    return Ok(());
                }
                Ok(Err(Error::RemoteRejected(reason))) => {
                    tracing::warn!("Pull refused by remote: {reason}");
                    return Ok(());
                }
                Ok(Err(error)) => return Err(error),
                Err(_) => {
                    tracing::warn!("Pull timed out");
                    result.interrupted = true;
                    return Ok(());
                }
            };

            let exhausted = page.records.len() < self.pull_page_size;
            for stored in page.records {
                let record = LedgerPayload::Alert(stored.record);
                if let Some(applied) = self.local.apply_remote(record, stored.version).await? {
                    self.state.reconcile(applied);
                    result.pulled += 1;
                }
            }

            match page.cursor {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => {
                    self.local.set_pull_cursor(&next).await?;
                    cursor = Some(next);
                }
                _ => return Ok(()),
            }
            if exhausted {
                return Ok(());
            }
        }
    }
}

const fn known_version(record: &LedgerPayload) -> Option<i64> {
    match record {
        LedgerPayload::Alert(alert) => alert.remote_version,
        LedgerPayload::Message(message) => message.remote_version,
    }
}
