//! HeartbeatLoop - worker 1 台分の定期 heartbeat

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::queue::TaskQueue;
use super::shutdown::ShutdownSignal;
use crate::domain::{TaskType, WorkerId};
use crate::error::StoreError;

pub struct HeartbeatLoop {
    queue: Arc<TaskQueue>,
    worker_id: WorkerId,
    capabilities: BTreeSet<TaskType>,
    interval: Duration,
}

impl HeartbeatLoop {
    pub fn new(
        queue: Arc<TaskQueue>,
        worker_id: WorkerId,
        capabilities: BTreeSet<TaskType>,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            worker_id,
            capabilities,
            interval,
        }
    }

    /// Beat every `interval` until `shutdown`.
    ///
    /// A worker evicted by the dead worker sweep (it was paused, not dead)
    /// registers again instead of failing.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately; registration already counted as one
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => self.beat().await,
            }
        }
        debug!(worker_id = %self.worker_id, "heartbeat stopped");
    }

    async fn beat(&self) {
        match self.queue.heartbeat(&self.worker_id).await {
            Ok(()) => {}
            Err(StoreError::WorkerNotFound(_)) => {
                info!(worker_id = %self.worker_id, "worker was evicted, registering again");
                if let Err(e) = self
                    .queue
                    .register(&self.worker_id, self.capabilities.clone())
                    .await
                {
                    warn!(worker_id = %self.worker_id, error = %e, "re-registration failed");
                }
            }
            Err(e) => warn!(worker_id = %self.worker_id, error = %e, "heartbeat failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::shutdown::shutdown_channel;
    use crate::ports::ManualClock;
    use crate::retry::RetryPolicy;
    use crate::store::InMemoryTaskStore;
    use chrono::Utc;

    #[tokio::test(start_paused = true)]
    async fn evicted_worker_registers_again() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(InMemoryTaskStore::with_clock(clock.clone()));
        let queue = Arc::new(TaskQueue::new(store, RetryPolicy::default()));
        let worker = WorkerId::new("w1");
        queue.register(&worker, BTreeSet::new()).await.unwrap();

        clock.advance(chrono::Duration::seconds(60));
        let evicted = queue
            .sweep_dead_workers(Duration::from_secs(10), 3)
            .await
            .unwrap();
        assert_eq!(evicted, vec![worker.clone()]);

        let (controller, signal) = shutdown_channel();
        let heartbeat = HeartbeatLoop::new(
            queue.clone(),
            worker.clone(),
            BTreeSet::new(),
            Duration::from_secs(1),
        );
        let handle = tokio::spawn(heartbeat.run(signal));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        controller.shutdown();
        handle.await.unwrap();

        let workers = queue.workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].worker_id, worker);
    }
}
