//! Cancellation token shared by every stage.

use std::sync::Arc;
use tokio::sync::watch;

/// Raises the stop request.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

/// Observes the stop request. Cheap to clone; one per stage.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected handle/signal pair.
pub fn stop_pair() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx: Arc::new(tx) }, StopSignal { rx })
}

impl StopHandle {
    /// Request every stage to stop. Idempotent.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// A new signal observing this handle.
    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once a stop has been requested.
    ///
    /// Also resolves when every [`StopHandle`] has been dropped, since nothing
    /// could request a stop any more.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn stop_wakes_all_signals() {
        let (handle, signal) = stop_pair();
        let other = handle.signal();
        assert!(!signal.is_stopped());

        let waiter = tokio::spawn(async move { other.stopped().await });
        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(signal.is_stopped());
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn stopped_resolves_immediately_after_stop() {
        let (handle, signal) = stop_pair();
        handle.stop();
        handle.stop();
        tokio::time::timeout(Duration::from_millis(50), signal.stopped())
            .await
            .unwrap();
    }
}
