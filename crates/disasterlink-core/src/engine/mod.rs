//! Offline-first sync engine facade.
//!
//! The UI talks only to [`SyncEngine`]: mutations are appended to the
//! durable ledger and reflected in the state store before they return, and
//! never wait on the network. A background driver drains the ledger when
//! connectivity allows.

mod driver;
#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use driver::Trigger;

use crate::backoff::BackoffController;
use crate::config::EngineConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::db::SyncMeta;
use crate::error::{Error, Result};
use crate::models::{
    AlertId, AlertRecord, EntityType, LedgerPayload, Location, MessageId, OpKind, Priority,
    QueuedMessage, SyncConflict,
};
use crate::services::LocalStore;
use crate::shutdown::ShutdownSignal;
use crate::state::EngineStatus;
use crate::store::{StateChange, StateStore, Subscription};
use crate::sync::{DrainResult, HttpRemote, Reconciler, RemoteAuthority};
use crate::util::{normalize_text_option, unix_millis_now};

pub(crate) struct EngineCore<R: RemoteAuthority> {
    config: EngineConfig,
    local: LocalStore,
    state: Arc<StateStore>,
    reconciler: Reconciler<R>,
    online: AtomicBool,
    write_gate: tokio::sync::Mutex<()>,
}

impl<R: RemoteAuthority> EngineCore<R> {
    fn idle_status(&self) -> EngineStatus {
        if self.online.load(Ordering::SeqCst) {
            EngineStatus::Idle
        } else {
            EngineStatus::Offline
        }
    }

    /// One drain with status bookkeeping; a clean drain is checkpointed.
    async fn run_drain(&self, shutdown: &ShutdownSignal) -> Result<DrainResult> {
        self.state.set_status(EngineStatus::Syncing);
        let outcome = match self.reconciler.drain(shutdown).await {
            Ok(result) if result.is_success() => self.checkpoint().await.map(|()| result),
            other => other,
        };

        match &outcome {
            Err(error) if error.is_storage_failure() => {
                self.state.set_status(EngineStatus::Degraded(error.to_string()));
            }
            _ => self.state.set_status(self.idle_status()),
        }
        outcome
    }

    async fn checkpoint(&self) -> Result<()> {
        self.local.record_drain_success(unix_millis_now()).await?;
        self.local.snapshot().await?;
        Ok(())
    }
}

struct DriverHandle {
    requests: mpsc::UnboundedSender<Trigger>,
    task: JoinHandle<()>,
}

/// Offline-first alert and message engine
pub struct SyncEngine<R: RemoteAuthority> {
    core: Arc<EngineCore<R>>,
    shutdown: ShutdownSignal,
    driver: Mutex<Option<DriverHandle>>,
}

impl SyncEngine<HttpRemote> {
    /// Open against the HTTP authority named by `config.remote_url`.
    pub async fn open_http(config: EngineConfig) -> Result<Self> {
        let url = config
            .remote_url
            .clone()
            .ok_or_else(|| Error::Config("remote URL is not configured".to_string()))?;
        let remote = HttpRemote::new(url, config.push_timeout)?;
        Self::open(config, Arc::new(remote)).await
    }
}

impl<R: RemoteAuthority> SyncEngine<R> {
    /// Open the local store and load the state store from it.
    ///
    /// Nothing is sent until [`Self::start`] or [`Self::drain_now`].
    pub async fn open(config: EngineConfig, remote: Arc<R>) -> Result<Self> {
        config.validate()?;
        let local = match &config.db_path {
            Some(path) => LocalStore::open_path(path, config.ledger_capacity).await?,
            None => LocalStore::open_in_memory(config.ledger_capacity).await?,
        };

        let state = Arc::new(StateStore::new(
            local.load_alerts().await?,
            local.load_messages().await?,
            local.open_conflicts().await?,
        ));
        let reconciler = Reconciler::new(local.clone(), Arc::clone(&state), remote)
            .with_push_timeout(config.push_timeout)
            .with_pull_page_size(config.pull_page_size);

        tracing::info!(
            pending = local.pending_count().await?,
            alerts = state.list_alerts().len(),
            "Sync engine opened"
        );

        Ok(Self {
            core: Arc::new(EngineCore {
                config,
                local,
                state,
                reconciler,
                online: AtomicBool::new(false),
                write_gate: tokio::sync::Mutex::new(()),
            }),
            shutdown: ShutdownSignal::new(),
            driver: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    pub fn remote(&self) -> &Arc<R> {
        self.core.reconciler.remote()
    }

    /// Monitor using the configured stability window, stopped with the engine.
    pub fn spawn_monitor(&self, initially_online: bool) -> ConnectivityMonitor {
        ConnectivityMonitor::spawn(
            initially_online,
            self.core.config.stability_window,
            self.shutdown.clone(),
        )
    }

    /// Start the background driver. Drains right away if already online.
    pub fn start(&self, monitor: &ConnectivityMonitor) -> Result<()> {
        let mut slot = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(Error::InvalidInput("sync engine already started".to_string()));
        }

        let (requests, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(
            driver::Driver {
                core: Arc::clone(&self.core),
                backoff: BackoffController::new(self.core.config.backoff),
                requests: receiver,
                events: monitor.subscribe(),
                online: monitor.watch(),
                shutdown: self.shutdown.clone(),
            }
            .run(),
        );
        *slot = Some(DriverHandle { requests, task });
        Ok(())
    }

    /// Stop the driver and wait for it. An in-flight drain stops at the next entry.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(error) = handle.task.await {
                tracing::error!("Sync driver panicked: {error}");
            }
        }
    }

    /// Ask the driver for a drain. Returns `false` when it is not running.
    pub fn sync_now(&self) -> bool {
        self.send(Trigger::Manual)
    }

    /// Drain in the caller's task, bypassing the driver and its backoff.
    pub async fn drain_now(&self) -> Result<DrainResult> {
        self.core.run_drain(&self.shutdown).await
    }

    fn send(&self, trigger: Trigger) -> bool {
        self.driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| handle.requests.send(trigger).is_ok())
    }

    /// Record a local mutation durably, then show it.
    async fn commit(&self, payload: LedgerPayload, op_kind: OpKind) -> Result<()> {
        let appended = self.core.local.append(&payload, op_kind).await;
        self.checked_write(appended)?;
        self.core.state.apply_local(payload);
        self.send(Trigger::LocalChange);
        Ok(())
    }

    fn checked_write<T>(&self, outcome: Result<T>) -> Result<T> {
        outcome.inspect_err(|error| {
            if error.is_storage_failure() {
                tracing::error!("Local write failed: {error}");
                self.core
                    .state
                    .set_status(EngineStatus::Degraded(error.to_string()));
            }
        })
    }

    /// Raise a new alert. Returns at once in the `Pending` state.
    pub async fn create_alert(
        &self,
        message: impl Into<String>,
        location: Location,
        priority: Priority,
    ) -> Result<AlertRecord> {
        let message = normalize_text_option(Some(message.into()))
            .ok_or_else(|| Error::InvalidInput("alert message cannot be empty".to_string()))?;
        let alert = AlertRecord::new(message, location, priority);
        alert.validate()?;

        let _write = self.core.write_gate.lock().await;
        self.commit(LedgerPayload::Alert(alert.clone()), OpKind::Create)
            .await?;
        Ok(self.core.state.get_alert(&alert.id).unwrap_or(alert))
    }

    /// Mark an alert resolved. Resolving twice is a no-op.
    pub async fn resolve_alert(&self, id: &AlertId) -> Result<AlertRecord> {
        self.update_alert(id, AlertRecord::resolve).await
    }

    pub async fn cancel_alert(&self, id: &AlertId) -> Result<AlertRecord> {
        self.update_alert(id, AlertRecord::cancel).await
    }

    /// Change the priority of an active alert.
    pub async fn escalate_alert(&self, id: &AlertId, priority: Priority) -> Result<AlertRecord> {
        self.update_alert(id, |alert, now| alert.set_priority(priority, now))
            .await
    }

    async fn update_alert(
        &self,
        id: &AlertId,
        change: impl FnOnce(&mut AlertRecord, i64) -> Result<bool> + Send,
    ) -> Result<AlertRecord> {
        let _write = self.core.write_gate.lock().await;
        let now = unix_millis_now();
        // Built from the stored record so a settlement that just landed is kept
        let changed = self
            .core
            .local
            .append_change(EntityType::Alert, &id.as_str(), |record| match record {
                LedgerPayload::Alert(alert) => change(alert, now),
                LedgerPayload::Message(_) => Ok(false),
            })
            .await;
        let (record, appended) = self.checked_write(changed)?;
        let LedgerPayload::Alert(alert) = record else {
            return Err(Error::NotFound(format!("alert {id}")));
        };
        if appended {
            self.core.state.apply_local(LedgerPayload::Alert(alert.clone()));
            self.send(Trigger::LocalChange);
        }
        Ok(self.core.state.get_alert(id).unwrap_or(alert))
    }

    /// Queue a message for delivery when connectivity allows.
    pub async fn queue_message(
        &self,
        recipient: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<QueuedMessage> {
        let recipient = normalize_text_option(Some(recipient.into()))
            .ok_or_else(|| Error::InvalidInput("message recipient cannot be empty".to_string()))?;
        let body = normalize_text_option(Some(body.into()))
            .ok_or_else(|| Error::InvalidInput("message body cannot be empty".to_string()))?;
        let message = QueuedMessage::new(recipient, body);
        message.validate()?;

        let _write = self.core.write_gate.lock().await;
        self.commit(LedgerPayload::Message(message.clone()), OpKind::Create)
            .await?;
        Ok(self.core.state.get_message(&message.id).unwrap_or(message))
    }

    /// All alerts, newest first.
    pub fn list_alerts(&self) -> Vec<AlertRecord> {
        self.core.state.list_alerts()
    }

    pub fn get_alert(&self, id: &AlertId) -> Option<AlertRecord> {
        self.core.state.get_alert(id)
    }

    /// All messages, newest first.
    pub fn list_messages(&self) -> Vec<QueuedMessage> {
        self.core.state.list_messages()
    }

    pub fn get_message(&self, id: &MessageId) -> Option<QueuedMessage> {
        self.core.state.get_message(id)
    }

    /// Conflicts waiting for the user, newest first.
    pub fn list_conflicts(&self) -> Vec<SyncConflict> {
        self.core.state.list_conflicts()
    }

    /// Recorded conflicts including dismissed ones.
    pub async fn conflict_history(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        self.core.local.conflict_history(limit).await
    }

    /// Acknowledge a conflict; the entity leaves the `Conflict` state once
    /// none remain open.
    pub async fn dismiss_conflict(&self, id: i64) -> Result<SyncConflict> {
        let (conflict, record) = self.core.local.dismiss_conflict(id).await?;
        self.core.state.dismiss_conflict(id);
        if let Some(record) = record {
            self.core.state.reconcile(record);
        }
        Ok(conflict)
    }

    /// Ledger entries not yet confirmed by the remote authority.
    pub async fn pending_count(&self) -> Result<usize> {
        self.core.local.pending_count().await
    }

    /// Pull cursor and the last checkpoint times.
    pub async fn sync_meta(&self) -> Result<SyncMeta> {
        self.core.local.meta().await
    }

    pub fn status(&self) -> EngineStatus {
        self.core.state.status()
    }

    pub fn on_state_change(
        &self,
        listener: impl Fn(&StateChange) + Send + Sync + 'static,
    ) -> Subscription {
        self.core.state.on_state_change(listener)
    }
}

impl<R: RemoteAuthority> Drop for SyncEngine<R> {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}
