use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::warn;

use super::queue::TaskQueue;
use super::shutdown::{ShutdownController, shutdown_channel};
use super::worker_loop::{WorkerLoop, WorkerReport};
use crate::breaker::{BreakerConfig, BreakerSet};
use crate::config::WorkerConfig;
use crate::domain::WorkerId;
use crate::error::StoreError;
use crate::typed::TypedRegistry;

/// Worker group handle.
/// - dropping the group (or `request_shutdown`) stops every worker
/// - `shutdown_and_join()` waits for all of them to drain
///
/// Each worker gets its own id and its own breakers; breaker state is
/// per process, like it would be across machines.
pub struct WorkerGroup {
    shutdown: ShutdownController,
    joins: Vec<JoinHandle<Result<WorkerReport, StoreError>>>,
}

impl WorkerGroup {
    /// Spawn `n` workers.
    pub fn spawn(
        n: usize,
        queue: Arc<TaskQueue>,
        registry: Arc<TypedRegistry>,
        breaker: BreakerConfig,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown, signal) = shutdown_channel();
        let prefix = config
            .worker_id
            .as_ref()
            .map_or_else(|| "worker".to_string(), |id| id.as_str().to_string());

        let joins = (0..n)
            .map(|i| {
                let worker_config = config
                    .clone()
                    .with_worker_id(WorkerId::generate(&format!("{prefix}-{i}")));
                let worker = WorkerLoop::new(
                    Arc::clone(&queue),
                    Arc::clone(&registry),
                    Arc::new(BreakerSet::new(breaker.clone())),
                    worker_config,
                );
                tokio::spawn(worker.run(signal.clone()))
            })
            .collect();

        Self { shutdown, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Stop claiming; in-flight tasks still finish within the grace period.
    pub fn request_shutdown(&self) {
        self.shutdown.shutdown();
    }

    /// Shutdown and wait for all workers. Workers that failed to start or
    /// panicked are logged and left out of the result.
    pub async fn shutdown_and_join(self) -> Vec<WorkerReport> {
        self.request_shutdown();
        let mut reports = Vec::with_capacity(self.joins.len());
        for join in self.joins {
            match join.await {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => warn!(error = %e, "worker exited with error"),
                Err(e) => warn!(error = %e, "worker task failed"),
            }
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::store::InMemoryTaskStore;
    use crate::typed::handler::fixtures::TestTaskHandler;
    use crate::typed::task::fixtures::TestTask;
    use std::time::Duration;

    #[tokio::test]
    async fn group_processes_everything_once() {
        let queue = Arc::new(TaskQueue::new(
            Arc::new(InMemoryTaskStore::new()),
            RetryPolicy::default(),
        ));
        let mut registry = TypedRegistry::new();
        registry.register::<TestTask, _>(TestTaskHandler).unwrap();
        for value in 0..20 {
            queue.submit_typed(&TestTask { value }).await.unwrap();
        }

        let config = WorkerConfig::default()
            .with_poll_interval(Duration::from_millis(5), Duration::from_millis(20));
        let group = WorkerGroup::spawn(
            4,
            Arc::clone(&queue),
            Arc::new(registry),
            BreakerConfig::default(),
            config,
        );
        assert_eq!(group.len(), 4);

        for _ in 0..200 {
            if queue.counts().await.unwrap().completed == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let reports = group.shutdown_and_join().await;

        assert_eq!(reports.len(), 4);
        assert_eq!(reports.iter().map(|r| r.completed).sum::<usize>(), 20);
        assert!(queue.workers().await.unwrap().is_empty());
    }
}
