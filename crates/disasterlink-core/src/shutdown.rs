//! Cooperative cancellation shared by the engine's background tasks.

use std::sync::Arc;

use tokio::sync::watch;

/// Cloneable cancellation token. Triggering it once stops every holder.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Ask every holder to stop
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `trigger` has been called
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as `self`, so this only returns on trigger
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_observe_trigger() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_triggered());

        let waiter = tokio::spawn(async move { clone.cancelled().await });
        signal.trigger();
        waiter.await.unwrap();
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_after_trigger() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        signal.cancelled().await;
    }
}
