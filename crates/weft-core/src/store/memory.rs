//! In-memory backend
//!
//! `tokio::sync::Mutex` 1 つで状態全体を守るので、各操作が 1 単位の作業になります。
//! ロック保持中に await はしません。

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::index::PendingKey;
use crate::domain::{
    DeadLetterEntry, DeadLetterFilter, DeadLetterId, ErrorCategory, NewTask, Priority, Progress,
    TaskId, TaskRecord, TaskStatus, TaskType, WorkerId, WorkerInfo,
};
use crate::error::StoreError;
use crate::observability::QueueCounts;
use crate::ports::{
    Clock, DeadLetterStore, IdGenerator, Submission, SystemClock, TaskStore, TaskView,
    UlidGenerator, WorkerRegistry,
};

/// Fault points for exercising partial failures of multi-step operations.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultPoint {
    /// After the dead-letter entry was written, before the task is removed.
    AfterDeadLetterInsert,
}

#[derive(Debug, Default)]
pub(super) struct StoreState {
    /// Pending and processing tasks (single source of truth).
    pub active: HashMap<TaskId, TaskRecord>,
    /// Claim order of pending tasks. Always in step with `active`.
    pub pending: BTreeSet<PendingKey>,
    pub completed: HashMap<TaskId, TaskRecord>,
    pub dead_letters: HashMap<DeadLetterId, DeadLetterEntry>,
    pub dead_letter_by_task: HashMap<TaskId, DeadLetterId>,
    pub idempotency: HashMap<String, TaskId>,
    pub workers: HashMap<WorkerId, WorkerInfo>,
    #[cfg(test)]
    pub fault: Option<FaultPoint>,
}

impl StoreState {
    pub fn insert_active(&mut self, record: TaskRecord) {
        if record.status == TaskStatus::Pending {
            self.pending.insert(PendingKey::of(&record));
        }
        self.active.insert(record.id, record);
    }

    /// Claimant check shared by every resolving transition.
    fn claimed_mut(
        &mut self,
        task_id: TaskId,
        worker_id: &WorkerId,
    ) -> Result<&mut TaskRecord, StoreError> {
        let record = self
            .active
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        if !record.is_claimed_by(worker_id) {
            return Err(StoreError::NotClaimant {
                task_id,
                worker_id: worker_id.clone(),
            });
        }
        Ok(record)
    }

    fn is_draining(&self, worker_id: &WorkerId) -> bool {
        self.workers.get(worker_id).is_some_and(|w| w.draining)
    }

    #[cfg(test)]
    fn take_fault(&mut self, point: FaultPoint) -> bool {
        if self.fault == Some(point) {
            self.fault = None;
            return true;
        }
        false
    }
}

/// `now + d`, saturating at the largest representable instant.
pub(super) fn after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - d`, saturating at the smallest representable instant.
pub(super) fn before(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// In-memory implementation of all three store ports.
pub struct InMemoryTaskStore {
    pub(super) state: Mutex<StoreState>,
    pub(super) clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Self::with_parts(clock, ids)
    }

    pub fn with_parts(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self::from_state(StoreState::default(), clock, ids)
    }

    pub(super) fn from_state(
        state: StoreState,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            state: Mutex::new(state),
            clock,
            ids,
        }
    }

    #[cfg(test)]
    pub(crate) async fn inject_fault(&self, point: FaultPoint) {
        self.state.lock().await.fault = Some(point);
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn submit(&self, request: NewTask, max_retries: u32) -> Result<Submission, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        if let Some(key) = &request.idempotency_key
            && let Some(&task_id) = state.idempotency.get(key)
        {
            return Ok(Submission {
                task_id,
                deduplicated: true,
            });
        }

        let task_id = self.ids.task_id();
        if let Some(key) = &request.idempotency_key {
            state.idempotency.insert(key.clone(), task_id);
        }
        state.insert_active(TaskRecord::new(task_id, request, max_retries, now));
        Ok(Submission {
            task_id,
            deduplicated: false,
        })
    }

    async fn claim(
        &self,
        worker_id: &WorkerId,
        capabilities: &BTreeSet<TaskType>,
        batch_size: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        if batch_size == 0 {
            return Err(StoreError::InvalidArgument(
                "batch_size must be at least 1".into(),
            ));
        }
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if state.is_draining(worker_id) {
            return Ok(Vec::new());
        }
        let state = &mut *state;

        let mut claimed = Vec::with_capacity(batch_size);
        let mut cursor = Bound::Unbounded;
        while claimed.len() < batch_size {
            let Some(key) = state.pending.range((cursor, Bound::Unbounded)).next().copied() else {
                break;
            };

            // rest of this band is in the future; skip to the next band
            if key.scheduled_at > now {
                match key.priority().lower() {
                    Some(lower) => {
                        cursor = Bound::Included(PendingKey::band_start(lower));
                        continue;
                    }
                    None => break,
                }
            }
            cursor = Bound::Excluded(key);

            let Some(record) = state.active.get_mut(&key.task_id) else {
                // index entry without a record; drop it
                state.pending.remove(&key);
                continue;
            };
            if !record.is_eligible(now) {
                state.pending.remove(&key);
                continue;
            }
            if !capabilities.is_empty() && !capabilities.contains(&record.task_type) {
                continue;
            }
            record.claim(worker_id.clone(), now);
            claimed.push(record.clone());
            state.pending.remove(&key);
        }
        Ok(claimed)
    }

    async fn complete(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        result_summary: Option<String>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.claimed_mut(task_id, worker_id)?;
        if let Some(mut record) = state.active.remove(&task_id) {
            record.complete(result_summary, now);
            state.completed.insert(task_id, record);
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        delay: Duration,
        error: String,
    ) -> Result<DateTime<Utc>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let record = state.claimed_mut(task_id, worker_id)?;
        if record.retry_count >= record.max_retries {
            return Err(StoreError::InvalidTransition {
                task_id,
                status: record.status,
                action: "reschedule beyond its retry budget",
            });
        }
        record.schedule_retry(after(now, delay), error, now);
        let (key, scheduled_at) = (PendingKey::of(record), record.scheduled_at);
        state.pending.insert(key);
        Ok(scheduled_at)
    }

    async fn release(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        delay: Duration,
    ) -> Result<DateTime<Utc>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let record = state.claimed_mut(task_id, worker_id)?;
        record.release(after(now, delay), now);
        let (key, scheduled_at) = (PendingKey::of(record), record.scheduled_at);
        state.pending.insert(key);
        Ok(scheduled_at)
    }

    async fn move_to_dead_letter(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        final_error: String,
        category: ErrorCategory,
    ) -> Result<DeadLetterId, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let record = state.claimed_mut(task_id, worker_id)?;

        let mut failed = record.clone();
        failed.mark_failed(final_error.clone(), now);
        let dead_letter_id = self.ids.dead_letter_id();
        let entry = DeadLetterEntry::from_task(
            dead_letter_id,
            &failed,
            final_error,
            category,
            worker_id.clone(),
            now,
        );

        state.dead_letters.insert(dead_letter_id, entry);

        #[cfg(test)]
        if state.take_fault(FaultPoint::AfterDeadLetterInsert) {
            // roll back the half-done unit of work
            state.dead_letters.remove(&dead_letter_id);
            return Err(StoreError::Unavailable(
                "injected fault after dead-letter insert".into(),
            ));
        }

        state.active.remove(&task_id);
        state.dead_letter_by_task.insert(task_id, dead_letter_id);
        Ok(dead_letter_id)
    }

    async fn reclaim_stuck(&self, threshold: Duration) -> Result<Vec<TaskId>, StoreError> {
        let now = self.clock.now();
        let cutoff = before(now, threshold);
        let mut state = self.state.lock().await;
        let state = &mut *state;

        let stuck: Vec<TaskId> = state
            .active
            .values()
            .filter(|r| r.status == TaskStatus::Processing)
            .filter(|r| r.claimed_at.is_some_and(|at| at < cutoff))
            .map(|r| r.id)
            .collect();

        for task_id in &stuck {
            if let Some(record) = state.active.get_mut(task_id) {
                record.release(now, now);
                let key = PendingKey::of(record);
                state.pending.insert(key);
            }
        }
        Ok(stuck)
    }

    async fn promote_aged(
        &self,
        age: Duration,
        step: u8,
        cap: Priority,
    ) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let cutoff = before(now, age);
        let mut state = self.state.lock().await;
        let state = &mut *state;

        let aged: Vec<PendingKey> = state
            .pending
            .iter()
            .filter(|k| k.scheduled_at <= cutoff && k.priority() < cap)
            .copied()
            .collect();

        let mut promoted = 0;
        for key in aged {
            let Some(record) = state.active.get_mut(&key.task_id) else {
                continue;
            };
            let raised = record.priority.raised(step, cap);
            if raised == record.priority {
                continue;
            }
            record.priority = raised;
            record.updated_at = now;
            let new_key = PendingKey::of(record);
            state.pending.remove(&key);
            state.pending.insert(new_key);
            promoted += 1;
        }
        Ok(promoted)
    }

    async fn report_progress(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        percent: u8,
        message: Option<String>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let record = state.claimed_mut(task_id, worker_id)?;
        record.progress = Some(Progress {
            percent: percent.min(100),
            message,
            reported_at: now,
        });
        record.updated_at = now;
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<TaskView>, StoreError> {
        let state = self.state.lock().await;
        if let Some(record) = state.active.get(&task_id) {
            return Ok(Some(TaskView::Active(record.clone())));
        }
        if let Some(record) = state.completed.get(&task_id) {
            return Ok(Some(TaskView::Completed(record.clone())));
        }
        Ok(state
            .dead_letter_by_task
            .get(&task_id)
            .and_then(|id| state.dead_letters.get(id))
            .map(|entry| TaskView::DeadLettered(entry.clone())))
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let state = self.state.lock().await;
        Ok(QueueCounts {
            pending: state.pending.len(),
            processing: state.active.len().saturating_sub(state.pending.len()),
            completed: state.completed.len(),
            dead_lettered: state.dead_letters.len(),
            workers: state.workers.len(),
        })
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryTaskStore {
    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let state = self.state.lock().await;
        let mut entries: Vec<DeadLetterEntry> = state
            .dead_letters
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.failed_at.cmp(&a.failed_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    async fn get_dead_letter(
        &self,
        id: DeadLetterId,
    ) -> Result<Option<DeadLetterEntry>, StoreError> {
        Ok(self.state.lock().await.dead_letters.get(&id).cloned())
    }

    async fn replay(&self, id: DeadLetterId) -> Result<TaskId, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let entry = state
            .dead_letters
            .get(&id)
            .ok_or(StoreError::DeadLetterNotFound(id))?;
        let request = entry.replay_request();
        let max_retries = entry.max_retries;

        let task_id = self.ids.task_id();
        state.insert_active(TaskRecord::new(task_id, request, max_retries, now));
        Ok(task_id)
    }
}

#[async_trait]
impl WorkerRegistry for InMemoryTaskStore {
    async fn register(
        &self,
        worker_id: &WorkerId,
        capabilities: BTreeSet<TaskType>,
    ) -> Result<WorkerInfo, StoreError> {
        let info = WorkerInfo::new(worker_id.clone(), capabilities, self.clock.now());
        self.state
            .lock()
            .await
            .workers
            .insert(worker_id.clone(), info.clone());
        Ok(info)
    }

    async fn heartbeat(&self, worker_id: &WorkerId) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| StoreError::WorkerNotFound(worker_id.clone()))?;
        worker.last_heartbeat = now;
        Ok(())
    }

    async fn mark_draining(&self, worker_id: &WorkerId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| StoreError::WorkerNotFound(worker_id.clone()))?;
        worker.draining = true;
        Ok(())
    }

    async fn deregister(&self, worker_id: &WorkerId) -> Result<(), StoreError> {
        self.state.lock().await.workers.remove(worker_id);
        Ok(())
    }

    async fn sweep_dead_workers(
        &self,
        heartbeat_interval: Duration,
        max_missed: u32,
    ) -> Result<Vec<WorkerId>, StoreError> {
        let silence = heartbeat_interval.saturating_mul(max_missed);
        let cutoff = before(self.clock.now(), silence);
        let mut state = self.state.lock().await;

        let mut dead: Vec<WorkerId> = state
            .workers
            .values()
            .filter(|w| w.last_heartbeat < cutoff)
            .map(|w| w.worker_id.clone())
            .collect();
        dead.sort();
        for worker_id in &dead {
            state.workers.remove(worker_id);
        }
        Ok(dead)
    }

    async fn workers(&self) -> Result<Vec<WorkerInfo>, StoreError> {
        let state = self.state.lock().await;
        let mut workers: Vec<WorkerInfo> = state.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }
}
