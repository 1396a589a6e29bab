//! TaskQueue - store backend の上に載るアプリケーション窓口
//!
//! Producer は submit、worker は claim と resolve、運用者は参照と replay。
//! 失敗の解決はここに集約されます:
//!
//! ```text
//! failure --breaker open--> release (リトライ回数を消費しない)
//!    |
//!    +--> classify --> decide --+--> Retry   --> reschedule
//!                               +--> GiveUp  --> dead-letter (code defect なら alert)
//! ```
//!
//! すべての遷移は `tracing` でログに残し、`EventSink` へ emit します。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::domain::{
    DeadLetterEntry, DeadLetterFilter, DeadLetterId, DomainEvent, ErrorCategory, FailOutcome,
    FailureKind, NewTask, Priority, RetryDecision, TaskFailure, TaskId, TaskRecord, TaskType,
    WorkerId, WorkerInfo,
};
use crate::error::StoreError;
use crate::observability::QueueCounts;
use crate::ports::{Backend, EventSink, NoopEventSink, TaskView};
use crate::retry::{ErrorClassifier, RetryPolicy, RetryScheduler};
use crate::typed::Task;

pub struct TaskQueue {
    backend: Arc<dyn Backend>,
    classifier: ErrorClassifier,
    scheduler: RetryScheduler,
    retry_budgets: HashMap<TaskType, u32>,
    release_delay: Duration,
    events: Arc<dyn EventSink>,
}

impl TaskQueue {
    pub fn new(backend: Arc<dyn Backend>, policy: RetryPolicy) -> Self {
        Self {
            backend,
            classifier: ErrorClassifier::new(),
            scheduler: RetryScheduler::new(policy),
            retry_budgets: HashMap::new(),
            release_delay: Duration::from_secs(5),
            events: Arc::new(NoopEventSink),
        }
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Per-type budgets used when a submission gives no `max_retries`.
    pub fn with_retry_budgets(mut self, budgets: HashMap<TaskType, u32>) -> Self {
        self.retry_budgets = budgets;
        self
    }

    /// Delay before a task refused by an open breaker becomes eligible again.
    pub fn with_release_delay(mut self, delay: Duration) -> Self {
        self.release_delay = delay;
        self
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn classify(&self, failure: &TaskFailure) -> ErrorCategory {
        self.classifier.classify(failure)
    }

    // ------------------------------------------------------------------
    // producer side
    // ------------------------------------------------------------------

    pub async fn submit(&self, request: NewTask) -> Result<TaskId, StoreError> {
        let max_retries = request
            .max_retries
            .or_else(|| self.retry_budgets.get(&request.task_type).copied())
            .unwrap_or(self.scheduler.policy().default_max_retries);
        let (task_type, priority) = (request.task_type.clone(), request.priority);

        let submission = self.backend.submit(request, max_retries).await?;
        if submission.deduplicated {
            debug!(task_id = %submission.task_id, "duplicate submission, returning existing task");
            return Ok(submission.task_id);
        }

        info!(
            task_id = %submission.task_id,
            task_type = %task_type,
            priority = %priority,
            max_retries,
            "task submitted"
        );
        self.events.emit(DomainEvent::TaskSubmitted {
            task_id: submission.task_id,
            task_type,
            priority,
        });
        Ok(submission.task_id)
    }

    pub async fn submit_typed<T: Task>(&self, task: &T) -> Result<TaskId, StoreError> {
        let request = task
            .to_new_task()
            .map_err(|e| StoreError::InvalidArgument(format!("encode {} payload: {e}", T::TYPE)))?;
        self.submit(request).await
    }

    // ------------------------------------------------------------------
    // worker side
    // ------------------------------------------------------------------

    pub async fn claim(
        &self,
        worker_id: &WorkerId,
        capabilities: &BTreeSet<TaskType>,
        batch_size: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let claimed = self
            .backend
            .claim(worker_id, capabilities, batch_size)
            .await?;
        for record in &claimed {
            debug!(
                task_id = %record.id,
                task_type = %record.task_type,
                worker_id = %worker_id,
                retry_count = record.retry_count,
                "task claimed"
            );
            self.events.emit(DomainEvent::TaskClaimed {
                task_id: record.id,
                worker_id: worker_id.clone(),
            });
        }
        Ok(claimed)
    }

    pub async fn complete(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        result_summary: Option<String>,
    ) -> Result<(), StoreError> {
        self.backend
            .complete(task_id, worker_id, result_summary)
            .await?;
        info!(task_id = %task_id, worker_id = %worker_id, "task completed");
        self.events.emit(DomainEvent::TaskCompleted {
            task_id,
            worker_id: worker_id.clone(),
        });
        Ok(())
    }

    /// Resolve a failed attempt of `task` (as claimed by `worker_id`).
    pub async fn fail(
        &self,
        task: &TaskRecord,
        worker_id: &WorkerId,
        failure: &TaskFailure,
    ) -> Result<FailOutcome, StoreError> {
        if failure.kind == FailureKind::BreakerOpen {
            let delay = self.release_delay;
            self.release(task.id, worker_id, delay).await?;
            return Ok(FailOutcome::Released { delay });
        }

        let category = self.classifier.classify(failure);
        if category == ErrorCategory::Unknown {
            warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                error = %failure,
                "unclassified failure, retrying conservatively"
            );
        }

        // budgets come from the stored record; a task no longer active is
        // left for the store to refuse
        let task = match self.backend.get(task.id).await? {
            Some(TaskView::Active(current)) => current,
            _ => task.clone(),
        };
        let task = &task;

        let decision = self.scheduler.decide(
            category,
            task.retry_count,
            task.max_retries,
            failure.retry_after,
        );
        match decision {
            RetryDecision::Retry { delay } => {
                self.backend
                    .reschedule(task.id, worker_id, delay, failure.to_string())
                    .await?;
                let retry_count = task.retry_count + 1;
                warn!(
                    task_id = %task.id,
                    category = %category,
                    retry_count,
                    max_retries = task.max_retries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %failure,
                    "task failed, rescheduled"
                );
                self.events.emit(DomainEvent::TaskRescheduled {
                    task_id: task.id,
                    category,
                    retry_count,
                    delay,
                });
                Ok(FailOutcome::Rescheduled {
                    delay,
                    retry_count,
                    category,
                })
            }
            RetryDecision::GiveUp { reason } => {
                let dead_letter_id = self
                    .backend
                    .move_to_dead_letter(task.id, worker_id, failure.to_string(), category)
                    .await?;
                error!(
                    task_id = %task.id,
                    dead_letter_id = %dead_letter_id,
                    category = %category,
                    reason = ?reason,
                    retry_count = task.retry_count,
                    error = %failure,
                    "task dead-lettered"
                );
                self.events.emit(DomainEvent::TaskDeadLettered {
                    task_id: task.id,
                    dead_letter_id,
                    category,
                });
                if category == ErrorCategory::CodeDefect {
                    error!(
                        alert = "code_defect",
                        task_id = %task.id,
                        task_type = %task.task_type,
                        error = %failure,
                        "code defect in task handler"
                    );
                    self.events.emit(DomainEvent::CodeDefectAlert {
                        task_id: task.id,
                        task_type: task.task_type.clone(),
                        error: failure.to_string(),
                    });
                }
                Ok(FailOutcome::DeadLettered {
                    dead_letter_id,
                    category,
                    reason,
                })
            }
        }
    }

    /// Back to pending without consuming a retry.
    pub async fn release(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        delay: Duration,
    ) -> Result<(), StoreError> {
        self.backend.release(task_id, worker_id, delay).await?;
        info!(task_id = %task_id, worker_id = %worker_id, "task released");
        self.events.emit(DomainEvent::TaskReleased { task_id, delay });
        Ok(())
    }

    pub async fn report_progress(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        percent: u8,
        message: Option<String>,
    ) -> Result<(), StoreError> {
        self.backend
            .report_progress(task_id, worker_id, percent, message)
            .await
    }

    // ------------------------------------------------------------------
    // liveness
    // ------------------------------------------------------------------

    pub async fn register(
        &self,
        worker_id: &WorkerId,
        capabilities: BTreeSet<TaskType>,
    ) -> Result<WorkerInfo, StoreError> {
        let info = self.backend.register(worker_id, capabilities).await?;
        info!(worker_id = %worker_id, capabilities = info.capabilities.len(), "worker registered");
        Ok(info)
    }

    pub async fn heartbeat(&self, worker_id: &WorkerId) -> Result<(), StoreError> {
        self.backend.heartbeat(worker_id).await
    }

    pub async fn mark_draining(&self, worker_id: &WorkerId) -> Result<(), StoreError> {
        self.backend.mark_draining(worker_id).await?;
        info!(worker_id = %worker_id, "worker draining");
        Ok(())
    }

    pub async fn deregister(&self, worker_id: &WorkerId) -> Result<(), StoreError> {
        self.backend.deregister(worker_id).await?;
        info!(worker_id = %worker_id, "worker deregistered");
        Ok(())
    }

    pub async fn sweep_dead_workers(
        &self,
        heartbeat_interval: Duration,
        max_missed: u32,
    ) -> Result<Vec<WorkerId>, StoreError> {
        let evicted = self
            .backend
            .sweep_dead_workers(heartbeat_interval, max_missed)
            .await?;
        for worker_id in &evicted {
            warn!(worker_id = %worker_id, "worker missed heartbeats, evicted");
            self.events.emit(DomainEvent::WorkerEvicted {
                worker_id: worker_id.clone(),
            });
        }
        Ok(evicted)
    }

    pub async fn reclaim_stuck(&self, threshold: Duration) -> Result<Vec<TaskId>, StoreError> {
        let reclaimed = self.backend.reclaim_stuck(threshold).await?;
        for task_id in &reclaimed {
            warn!(task_id = %task_id, "task stuck in processing, reclaimed");
            self.events.emit(DomainEvent::TaskReclaimed { task_id: *task_id });
        }
        Ok(reclaimed)
    }

    pub async fn promote_aged(
        &self,
        age: Duration,
        step: u8,
        cap: Priority,
    ) -> Result<usize, StoreError> {
        let count = self.backend.promote_aged(age, step, cap).await?;
        if count > 0 {
            info!(count, cap = %cap, "aged tasks promoted");
            self.events.emit(DomainEvent::TasksPromoted { count });
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // operators
    // ------------------------------------------------------------------

    pub async fn get(&self, task_id: TaskId) -> Result<Option<TaskView>, StoreError> {
        self.backend.get(task_id).await
    }

    pub async fn counts(&self) -> Result<QueueCounts, StoreError> {
        self.backend.counts().await
    }

    pub async fn workers(&self) -> Result<Vec<WorkerInfo>, StoreError> {
        self.backend.workers().await
    }

    pub async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        self.backend.list_dead_letters(filter).await
    }

    pub async fn get_dead_letter(
        &self,
        id: DeadLetterId,
    ) -> Result<Option<DeadLetterEntry>, StoreError> {
        self.backend.get_dead_letter(id).await
    }

    pub async fn replay(&self, id: DeadLetterId) -> Result<TaskId, StoreError> {
        let new_task_id = self.backend.replay(id).await?;
        info!(dead_letter_id = %id, new_task_id = %new_task_id, "dead letter replayed");
        self.events.emit(DomainEvent::TaskReplayed {
            dead_letter_id: id,
            new_task_id,
        });
        Ok(new_task_id)
    }
}
