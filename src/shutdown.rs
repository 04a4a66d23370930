use std::future;
use std::time::Duration;

use tokio::sync::watch;

/// Sending half, held by whatever observes the interrupt (Ctrl-C in `main`).
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // Receivers may already be gone if the monitor finished first.
        let _ = self.tx.send(true);
    }
}

/// Receiving half, cloned into every place that sleeps.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl Shutdown {
    /// A signal that can never fire.
    pub fn never() -> Self {
        channel().1
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|stop| *stop).await.is_err() {
            // Trigger dropped without firing.
            future::pending::<()>().await;
        }
    }

    /// Sleeps for `duration` unless shutdown fires first. Returns `false` when interrupted.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.triggered() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_runs_to_completion_without_signal() {
        let shutdown = Shutdown::never();
        assert!(shutdown.sleep(Duration::from_secs(60)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_returns_early_once_triggered() {
        let (trigger, shutdown) = channel();
        trigger.trigger();
        assert!(shutdown.is_triggered());
        assert!(!shutdown.sleep(Duration::from_secs(3600)).await);
    }
}
