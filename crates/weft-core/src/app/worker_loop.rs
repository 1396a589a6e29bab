//! WorkerLoop - タスク実行ループ
//!
//! # フロー
//! 1. register（capabilities = 登録済み task_type）して heartbeat を開始
//! 2. `min(batch_size, concurrency - in_flight)` 件まで claim
//! 3. Handler ごとに tokio task を起動、dependency があれば CircuitBreaker 経由
//! 4. complete するか、失敗を `TaskQueue::fail` に渡す
//! 5. shutdown 時: draining にして grace period まで in-flight を待ち、
//!    heartbeat を止めて deregister
//!
//! grace period を過ぎても動いている task は abandon されます。claim された
//! まま残り、reaper の stuck sweep が pending に戻します。
//!
//! # 学習ポイント
//! - `JoinSet` による並行数の制御
//! - `tokio::spawn` で panic を隔離（`JoinError::is_panic`）
//! - Drop guard（`AbortOnDrop`）による cancel の伝播

use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::task::{AbortHandle, JoinError, JoinSet};
use tracing::{debug, info, warn};

use super::heartbeat::HeartbeatLoop;
use super::op_retry::retry_store_op;
use super::queue::TaskQueue;
use super::shutdown::{ShutdownSignal, shutdown_channel};
use crate::breaker::BreakerSet;
use crate::config::WorkerConfig;
use crate::domain::{FailOutcome, TaskFailure, TaskRecord, TaskType, WorkerId};
use crate::error::StoreError;
use crate::typed::{DynHandler, TaskContext, TaskOutput, TypedRegistry};

/// What one worker did between start and shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub completed: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    pub released: usize,
    /// Still running when the grace period ended.
    pub abandoned: usize,
    /// Outcome could not be recorded; the reaper will pick the task up.
    pub lost: usize,
}

impl WorkerReport {
    fn record(&mut self, joined: Result<Resolution, JoinError>) {
        match joined {
            Ok(Resolution::Completed) => self.completed += 1,
            Ok(Resolution::Rescheduled) => self.rescheduled += 1,
            Ok(Resolution::DeadLettered) => self.dead_lettered += 1,
            Ok(Resolution::Released) => self.released += 1,
            Ok(Resolution::Lost) => self.lost += 1,
            Err(e) if e.is_cancelled() => {}
            Err(_) => self.lost += 1,
        }
    }
}

enum Resolution {
    Completed,
    Rescheduled,
    DeadLettered,
    Released,
    Lost,
}

impl From<FailOutcome> for Resolution {
    fn from(outcome: FailOutcome) -> Self {
        match outcome {
            FailOutcome::Rescheduled { .. } => Resolution::Rescheduled,
            FailOutcome::DeadLettered { .. } => Resolution::DeadLettered,
            FailOutcome::Released { .. } => Resolution::Released,
        }
    }
}

struct Shared {
    queue: Arc<TaskQueue>,
    registry: Arc<TypedRegistry>,
    breakers: Arc<BreakerSet>,
    config: WorkerConfig,
    worker_id: WorkerId,
}

pub struct WorkerLoop {
    shared: Arc<Shared>,
}

impl WorkerLoop {
    pub fn new(
        queue: Arc<TaskQueue>,
        registry: Arc<TypedRegistry>,
        breakers: Arc<BreakerSet>,
        config: WorkerConfig,
    ) -> Self {
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| WorkerId::generate("worker"));
        Self {
            shared: Arc::new(Shared {
                queue,
                registry,
                breakers,
                config,
                worker_id,
            }),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.shared.worker_id
    }

    /// Run until `shutdown` is requested, then drain and deregister.
    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<WorkerReport, StoreError> {
        let s = &*self.shared;
        if s.registry.is_empty() {
            return Err(StoreError::InvalidArgument(
                "worker has no handlers registered".to_string(),
            ));
        }
        let capabilities = s.registry.capabilities();
        let (attempts, base) = (s.config.op_retry_attempts, s.config.op_retry_base);

        retry_store_op(attempts, base, "register", || {
            s.queue.register(&s.worker_id, capabilities.clone())
        })
        .await?;

        let (heartbeat_stop, heartbeat_signal) = shutdown_channel();
        let heartbeat = tokio::spawn(
            HeartbeatLoop::new(
                Arc::clone(&s.queue),
                s.worker_id.clone(),
                capabilities.clone(),
                s.config.heartbeat_interval,
            )
            .run(heartbeat_signal),
        );
        info!(
            worker_id = %s.worker_id,
            concurrency = s.config.concurrency,
            batch_size = s.config.batch_size,
            "worker started"
        );

        let mut report = WorkerReport::default();
        let mut in_flight: JoinSet<Resolution> = JoinSet::new();
        self.claim_loop(&capabilities, &mut in_flight, &mut report, &mut shutdown)
            .await;

        self.drain(&mut in_flight, &mut report).await;

        heartbeat_stop.shutdown();
        let _ = heartbeat.await;
        if let Err(e) = retry_store_op(attempts, base, "deregister", || {
            s.queue.deregister(&s.worker_id)
        })
        .await
        {
            warn!(worker_id = %s.worker_id, error = %e, "deregistration failed");
        }

        info!(worker_id = %s.worker_id, report = ?report, "worker stopped");
        Ok(report)
    }

    async fn claim_loop(
        &self,
        capabilities: &BTreeSet<TaskType>,
        in_flight: &mut JoinSet<Resolution>,
        report: &mut WorkerReport,
        shutdown: &mut ShutdownSignal,
    ) {
        let s = &*self.shared;
        let mut poll = s.config.poll_interval_min;

        while !shutdown.is_requested() {
            while let Some(joined) = in_flight.try_join_next() {
                report.record(joined);
            }

            let capacity = s.config.concurrency.saturating_sub(in_flight.len());
            if capacity == 0 {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    Some(joined) = in_flight.join_next() => report.record(joined),
                }
                continue;
            }

            let claimed = retry_store_op(
                s.config.op_retry_attempts,
                s.config.op_retry_base,
                "claim",
                || s.queue.claim(&s.worker_id, capabilities, s.config.batch_size.min(capacity)),
            )
            .await
            .unwrap_or_else(|e| {
                warn!(worker_id = %s.worker_id, error = %e, "claim failed");
                Vec::new()
            });

            if claimed.is_empty() {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
                poll = poll.saturating_mul(2).min(s.config.poll_interval_max);
                continue;
            }

            poll = s.config.poll_interval_min;
            for record in claimed {
                let shared = Arc::clone(&self.shared);
                in_flight.spawn(async move { shared.process(record).await });
            }
        }
    }

    async fn drain(&self, in_flight: &mut JoinSet<Resolution>, report: &mut WorkerReport) {
        let s = &*self.shared;
        if let Err(e) = s.queue.mark_draining(&s.worker_id).await {
            warn!(worker_id = %s.worker_id, error = %e, "could not mark worker draining");
        }
        if in_flight.is_empty() {
            return;
        }

        info!(worker_id = %s.worker_id, in_flight = in_flight.len(), "waiting for in-flight tasks");
        let finished = tokio::time::timeout(s.config.shutdown_grace, async {
            while let Some(joined) = in_flight.join_next().await {
                report.record(joined);
            }
        })
        .await;

        if finished.is_err() {
            report.abandoned += in_flight.len();
            warn!(
                worker_id = %s.worker_id,
                abandoned = in_flight.len(),
                "shutdown grace period elapsed, abandoning tasks"
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }
    }
}

impl Shared {
    async fn process(&self, record: TaskRecord) -> Resolution {
        debug!(
            task_id = %record.id,
            task_type = %record.task_type,
            retry_count = record.retry_count,
            "task started"
        );
        let result = self.execute(&record).await;
        self.resolve(&record, result).await
    }

    async fn execute(&self, record: &TaskRecord) -> Result<TaskOutput, TaskFailure> {
        let Some(handler) = self.registry.get(record.task_type.as_str()) else {
            return Err(TaskFailure::defect(format!(
                "no handler registered for {}",
                record.task_type
            )));
        };
        let ctx = TaskContext::new(
            record,
            self.worker_id.clone(),
            Arc::clone(self.queue.backend()),
            self.config.progress_min_interval,
        );
        let dependency = handler.dependency().map(str::to_owned);
        let payload = record.payload.clone();

        let attempt = async {
            match dependency {
                Some(key) => {
                    let breaker = self.breakers.get(&key);
                    breaker
                        .execute_classified(
                            || run_handler(handler, payload, ctx),
                            |failure| self.queue.classify(failure).trips_breaker(),
                        )
                        .await
                        .map_err(TaskFailure::from)
                }
                None => run_handler(handler, payload, ctx).await,
            }
        };

        let timeout = self.config.task_timeout;
        tokio::time::timeout(timeout, attempt)
            .await
            .unwrap_or_else(|_| Err(TaskFailure::timeout(format!("task exceeded {timeout:?}"))))
    }

    async fn resolve(
        &self,
        record: &TaskRecord,
        result: Result<TaskOutput, TaskFailure>,
    ) -> Resolution {
        let (attempts, base) = (self.config.op_retry_attempts, self.config.op_retry_base);
        let recorded = match result {
            Ok(output) => retry_store_op(attempts, base, "complete", || {
                self.queue
                    .complete(record.id, &self.worker_id, output.summary.clone())
            })
            .await
            .map(|()| Resolution::Completed),
            Err(failure) => retry_store_op(attempts, base, "fail", || {
                self.queue.fail(record, &self.worker_id, &failure)
            })
            .await
            .map(Resolution::from),
        };

        recorded.unwrap_or_else(|e| {
            warn!(
                task_id = %record.id,
                worker_id = %self.worker_id,
                error = %e,
                "could not record task outcome"
            );
            Resolution::Lost
        })
    }
}

/// Aborts the handler task when the surrounding future is dropped
/// (timeout, shutdown abort).
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run one handler invocation in its own tokio task so a panic becomes a
/// code defect instead of taking the worker down.
async fn run_handler(
    handler: Arc<dyn DynHandler>,
    payload: serde_json::Value,
    ctx: TaskContext,
) -> Result<TaskOutput, TaskFailure> {
    let task = tokio::spawn(async move { handler.handle_dyn(payload, &ctx).await });
    let _guard = AbortOnDrop(task.abort_handle());
    match task.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(TaskFailure::defect(format!(
            "handler panicked: {}",
            panic_message(&*e.into_panic())
        ))),
        Err(e) => Err(TaskFailure::defect(format!("handler task failed: {e}"))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
