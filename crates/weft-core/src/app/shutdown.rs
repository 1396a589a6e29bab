//! Shutdown シグナル（協調的な停止）
//!
//! # 学習ポイント
//! - `tokio::sync::watch` で 1 対多の通知

use tokio::sync::watch;

/// Sending side. Dropping it also counts as a shutdown request.
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

/// Receiving side, cheap to clone into every loop.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownController { tx }, ShutdownSignal { rx })
}

impl ShutdownController {
    pub fn shutdown(&self) {
        // receivers may already be gone
        let _ = self.tx.send(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownSignal {
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once shutdown is requested or the controller is dropped.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|requested| *requested).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_after_shutdown() {
        let (controller, mut signal) = shutdown_channel();
        assert!(!signal.is_requested());

        let waiter = tokio::spawn(async move {
            signal.wait().await;
            signal.is_requested()
        });
        controller.shutdown();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn dropping_the_controller_counts_as_shutdown() {
        let (controller, mut signal) = shutdown_channel();
        drop(controller);
        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .unwrap();
        assert!(signal.is_requested());
    }

    #[tokio::test]
    async fn late_subscribers_see_the_request() {
        let (controller, _signal) = shutdown_channel();
        controller.shutdown();
        assert!(controller.signal().is_requested());
    }
}
