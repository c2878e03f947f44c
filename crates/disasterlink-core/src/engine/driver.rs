//! Background sync loop.
//!
//! One task owns the backoff state and decides when to drain: on startup,
//! when connectivity returns, after local changes, on manual request and
//! when the retry timer fires. At most one drain runs; requests that arrive
//! meanwhile collapse into a single follow-up drain.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use super::EngineCore;
use crate::backoff::BackoffController;
use crate::connectivity::{sleep_until, ConnectivityEvent};
use crate::error::Result;
use crate::shutdown::ShutdownSignal;
use crate::state::EngineStatus;
use crate::sync::{DrainResult, RemoteAuthority};

/// Why a drain was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Startup,
    Connected,
    Retry,
    Manual,
    LocalChange,
}

type DrainFuture = Pin<Box<dyn Future<Output = (Trigger, Result<DrainResult>)> + Send>>;

pub(super) struct Driver<R: RemoteAuthority> {
    pub(super) core: Arc<EngineCore<R>>,
    pub(super) backoff: BackoffController,
    pub(super) requests: mpsc::UnboundedReceiver<Trigger>,
    pub(super) events: broadcast::Receiver<ConnectivityEvent>,
    pub(super) online: watch::Receiver<bool>,
    pub(super) shutdown: ShutdownSignal,
}

#[derive(Default)]
struct Schedule {
    in_flight: Option<DrainFuture>,
    follow_up: Option<Trigger>,
    retry_at: Option<Instant>,
}

impl<R: RemoteAuthority> Driver<R> {
    pub(super) async fn run(mut self) {
        let mut schedule = Schedule::default();
        let mut monitor_alive = true;

        let online = *self.online.borrow();
        self.set_online(online);
        if online {
            self.request(Trigger::Startup, &mut schedule);
        }

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                (trigger, outcome) = join(&mut schedule.in_flight), if schedule.in_flight.is_some() => {
                    schedule.in_flight = None;
                    self.finish(trigger, &outcome, &mut schedule);
                    if let Some(next) = schedule.follow_up.take() {
                        self.request(next, &mut schedule);
                    }
                }
                event = self.events.recv(), if monitor_alive => match event {
                    Ok(ConnectivityEvent::Connected) => {
                        self.set_online(true);
                        schedule.retry_at = None;
                        self.request(Trigger::Connected, &mut schedule);
                    }
                    Ok(ConnectivityEvent::Disconnected) => self.set_online(false),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Missed {skipped} connectivity events");
                        let online = *self.online.borrow();
                        self.set_online(online);
                        if online {
                            self.request(Trigger::Connected, &mut schedule);
                        }
                    }
                    Err(RecvError::Closed) => {
                        tracing::debug!("Connectivity monitor gone");
                        monitor_alive = false;
                    }
                },
                request = self.requests.recv() => match request {
                    Some(trigger) => self.request(trigger, &mut schedule),
                    None => break,
                },
                () = sleep_until(schedule.retry_at), if schedule.retry_at.is_some() => {
                    schedule.retry_at = None;
                    if self.is_online() {
                        self.request(Trigger::Retry, &mut schedule);
                    } else {
                        tracing::debug!("Retry dropped while offline");
                    }
                }
            }
        }

        if let Some(drain) = schedule.in_flight.take() {
            let (_, outcome) = drain.await;
            if let Err(error) = outcome {
                tracing::warn!("Drain interrupted by shutdown failed: {error}");
            }
        }
        tracing::debug!("Sync driver stopped");
    }

    fn is_online(&self) -> bool {
        self.core.online.load(Ordering::SeqCst)
    }

    fn set_online(&self, online: bool) {
        self.core.online.store(online, Ordering::SeqCst);
        self.core.state.set_status(if online {
            EngineStatus::Idle
        } else {
            EngineStatus::Offline
        });
    }

    fn request(&self, trigger: Trigger, schedule: &mut Schedule) {
        if schedule.in_flight.is_some() {
            // A manual request outranks whatever else is waiting
            if trigger == Trigger::Manual {
                schedule.follow_up = Some(trigger);
            } else {
                schedule.follow_up.get_or_insert(trigger);
            }
            return;
        }
        match trigger {
            Trigger::Manual => {}
            Trigger::LocalChange if schedule.retry_at.is_some() => {
                tracing::debug!("Local change waits for the armed retry");
                return;
            }
            _ if !self.is_online() => {
                tracing::debug!("Skipping {trigger:?} drain while offline");
                return;
            }
            _ => {}
        }

        tracing::debug!("Starting drain ({trigger:?})");
        let core = Arc::clone(&self.core);
        let shutdown = self.shutdown.clone();
        schedule.in_flight = Some(Box::pin(async move {
            let outcome = core.run_drain(&shutdown).await;
            (trigger, outcome)
        }));
    }

    fn finish(
        &mut self,
        trigger: Trigger,
        outcome: &Result<DrainResult>,
        schedule: &mut Schedule,
    ) {
        match outcome {
            Ok(result) if result.is_success() => {
                self.backoff.reset();
                schedule.retry_at = None;
            }
            Ok(_) => self.schedule_retry(trigger, schedule),
            Err(error) if error.is_storage_failure() => {
                tracing::error!("Drain stopped by local storage failure: {error}");
                schedule.retry_at = None;
            }
            Err(error) => {
                tracing::warn!("Drain failed: {error}");
                self.schedule_retry(trigger, schedule);
            }
        }
    }

    fn schedule_retry(&mut self, trigger: Trigger, schedule: &mut Schedule) {
        if trigger == Trigger::Manual && schedule.retry_at.is_some() {
            return;
        }
        let retry = self.backoff.next_delay();
        tracing::info!(
            attempt = retry.attempt,
            ceiling_ms = u64::try_from(retry.ceiling.as_millis()).unwrap_or(u64::MAX),
            "Retrying drain in {} ms",
            retry.delay.as_millis()
        );
        schedule.retry_at = Some(Instant::now() + retry.delay);
    }
}

async fn join(drain: &mut Option<DrainFuture>) -> (Trigger, Result<DrainResult>) {
    match drain {
        Some(drain) => drain.await,
        None => std::future::pending().await,
    }
}
