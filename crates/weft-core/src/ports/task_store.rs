//! Store ports - worker プロセス間で唯一共有される可変状態
//!
//! 関心ごとに 3 つの trait に分割:
//! - `TaskStore`: active task、claim プロトコル、resolve 遷移
//! - `DeadLetterStore`: 終端アーカイブと replay
//! - `WorkerRegistry`: 生存情報
//!
//! dead-letter 遷移は task の削除と entry の挿入を 1 単位で行う必要があるため、
//! backend は 3 つすべてを実装します（`Backend`）。
//!
//! # 設計ルール
//! - resolve 遷移はすべて呼び出し元が現在の claimant かを確認し、違えば何も
//!   変更しない（`StoreError::NotClaimant`）
//! - `claim` は対象がなければ空の Vec を返し、待たない
//! - `StoreError::Unavailable` は「操作全体をリトライせよ」の意味

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    DeadLetterEntry, DeadLetterFilter, DeadLetterId, ErrorCategory, NewTask, Priority, TaskId,
    TaskRecord, TaskType, WorkerId, WorkerInfo,
};
use crate::error::StoreError;
use crate::observability::QueueCounts;

/// Result of `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub task_id: TaskId,
    /// The idempotency key matched an earlier submission; nothing was created.
    pub deduplicated: bool,
}

/// Where a task currently lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskView {
    /// Pending or processing.
    Active(TaskRecord),
    Completed(TaskRecord),
    DeadLettered(DeadLetterEntry),
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a pending task eligible immediately.
    ///
    /// `max_retries` is the resolved budget (the request's own value already
    /// applied by the caller).
    async fn submit(&self, request: NewTask, max_retries: u32) -> Result<Submission, StoreError>;

    /// Atomically select up to `batch_size` eligible tasks (priority desc,
    /// scheduled_at asc), mark them processing for `worker_id` and return
    /// them. Types outside a non-empty `capabilities` set are skipped.
    async fn claim(
        &self,
        worker_id: &WorkerId,
        capabilities: &BTreeSet<TaskType>,
        batch_size: usize,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    async fn complete(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        result_summary: Option<String>,
    ) -> Result<(), StoreError>;

    /// Back to pending after `delay`, consuming one retry. Returns the new
    /// `scheduled_at`.
    async fn reschedule(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        delay: Duration,
        error: String,
    ) -> Result<DateTime<Utc>, StoreError>;

    /// Back to pending after `delay` without consuming a retry.
    async fn release(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        delay: Duration,
    ) -> Result<DateTime<Utc>, StoreError>;

    /// Remove the task and insert its dead-letter entry as one unit.
    async fn move_to_dead_letter(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        final_error: String,
        category: ErrorCategory,
    ) -> Result<DeadLetterId, StoreError>;

    /// Release every processing task claimed longer than `threshold` ago.
    async fn reclaim_stuck(&self, threshold: Duration) -> Result<Vec<TaskId>, StoreError>;

    /// Raise the priority of tasks eligible for at least `age` by `step`,
    /// never above `cap`. Returns how many were raised.
    async fn promote_aged(
        &self,
        age: Duration,
        step: u8,
        cap: Priority,
    ) -> Result<usize, StoreError>;

    async fn report_progress(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        percent: u8,
        message: Option<String>,
    ) -> Result<(), StoreError>;

    async fn get(&self, task_id: TaskId) -> Result<Option<TaskView>, StoreError>;

    async fn counts(&self) -> Result<QueueCounts, StoreError>;
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Newest first.
    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, StoreError>;

    async fn get_dead_letter(&self, id: DeadLetterId)
    -> Result<Option<DeadLetterEntry>, StoreError>;

    /// Create a fresh pending task from the entry. The entry is left as is.
    async fn replay(&self, id: DeadLetterId) -> Result<TaskId, StoreError>;
}

#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Insert or replace the row of `worker_id`.
    async fn register(
        &self,
        worker_id: &WorkerId,
        capabilities: BTreeSet<TaskType>,
    ) -> Result<WorkerInfo, StoreError>;

    /// `WorkerNotFound` once the row was swept; the worker should register
    /// again.
    async fn heartbeat(&self, worker_id: &WorkerId) -> Result<(), StoreError>;

    /// A draining worker gets nothing from `claim`.
    async fn mark_draining(&self, worker_id: &WorkerId) -> Result<(), StoreError>;

    async fn deregister(&self, worker_id: &WorkerId) -> Result<(), StoreError>;

    /// Delete rows whose last heartbeat is older than
    /// `heartbeat_interval * max_missed`. Returns the deleted ids.
    async fn sweep_dead_workers(
        &self,
        heartbeat_interval: Duration,
        max_missed: u32,
    ) -> Result<Vec<WorkerId>, StoreError>;

    async fn workers(&self) -> Result<Vec<WorkerInfo>, StoreError>;
}

/// Everything the task queue needs from one backend.
pub trait Backend: TaskStore + DeadLetterStore + WorkerRegistry {}

impl<T: TaskStore + DeadLetterStore + WorkerRegistry> Backend for T {}
