//! Connectivity monitor with a stability window.
//!
//! Raw online/offline reports are fed in with [`ConnectivityMonitor::report`];
//! a transition is only announced after the new state has held for the whole
//! window, so a flapping link produces no events at all.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::shutdown::ShutdownSignal;

/// Debounced connectivity transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Connected,
    Disconnected,
}

/// Pure debounce state machine, driven by explicit timestamps
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    stable: bool,
    candidate: Option<(bool, Instant)>,
}

impl Debouncer {
    pub const fn new(window: Duration, initially_online: bool) -> Self {
        Self {
            window,
            stable: initially_online,
            candidate: None,
        }
    }

    /// Record a raw report taken at `now`
    pub fn observe(&mut self, online: bool, now: Instant) {
        if online == self.stable {
            self.candidate = None;
        } else if self.candidate.map(|(value, _)| value) != Some(online) {
            self.candidate = Some((online, now));
        }
    }

    /// When the pending candidate becomes stable, if there is one
    pub fn deadline(&self) -> Option<Instant> {
        self.candidate.map(|(_, since)| since + self.window)
    }

    /// Promote the candidate once it has held for the window
    pub fn poll(&mut self, now: Instant) -> Option<ConnectivityEvent> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        let (online, _) = self.candidate.take()?;
        self.stable = online;
        Some(if online {
            ConnectivityEvent::Connected
        } else {
            ConnectivityEvent::Disconnected
        })
    }

    /// Last stable state
    pub const fn is_online(&self) -> bool {
        self.stable
    }
}

/// Injectable connectivity source for the sync loop
pub struct ConnectivityMonitor {
    reports: mpsc::UnboundedSender<bool>,
    online: watch::Receiver<bool>,
    events: broadcast::Sender<ConnectivityEvent>,
    task: JoinHandle<()>,
}

impl ConnectivityMonitor {
    /// Start the debounce task. Must be called inside a tokio runtime.
    pub fn spawn(initially_online: bool, window: Duration, shutdown: ShutdownSignal) -> Self {
        let (reports, mut raw) = mpsc::unbounded_channel();
        let (online_tx, online) = watch::channel(initially_online);
        let (events, _) = broadcast::channel(16);
        let sender = events.clone();

        let task = tokio::spawn(async move {
            let mut debouncer = Debouncer::new(window, initially_online);
            loop {
                let deadline = debouncer.deadline();
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    report = raw.recv() => match report {
                        Some(value) => debouncer.observe(value, Instant::now()),
                        None => break,
                    },
                    () = sleep_until(deadline), if deadline.is_some() => {}
                }

                if let Some(event) = debouncer.poll(Instant::now()) {
                    tracing::info!("Connectivity changed: {event:?}");
                    online_tx.send_replace(event == ConnectivityEvent::Connected);
                    // No subscribers is fine
                    let _ = sender.send(event);
                }
            }
            tracing::debug!("Connectivity monitor stopped");
        });

        Self {
            reports,
            online,
            events,
            task,
        }
    }

    /// Feed a raw connectivity observation
    pub fn report(&self, online: bool) {
        if self.reports.send(online).is_err() {
            tracing::debug!("Connectivity report after monitor stopped");
        }
    }

    /// Debounced connectivity
    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Debounced state as a watch channel
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.online.clone()
    }

    /// Stream of debounced transitions
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }

    /// Whether the debounce task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
