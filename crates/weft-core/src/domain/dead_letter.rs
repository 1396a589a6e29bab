//! Dead-letter entries: terminal archive of permanently failed tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::failure::ErrorCategory;
use super::ids::{DeadLetterId, TaskId, WorkerId};
use super::task::{NewTask, Priority, TaskRecord, TaskType};

/// Snapshot of a task at the moment it was given up on.
///
/// Immutable once written. Replay builds a fresh task from it and leaves the
/// entry untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub final_error: String,
    pub category: ErrorCategory,
    /// Retries consumed before giving up (attempts = retry_count + 1).
    pub retry_count: u32,
    pub max_retries: u32,
    pub failed_at: DateTime<Utc>,
    pub failed_by: WorkerId,
    pub task_created_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn from_task(
        id: DeadLetterId,
        task: &TaskRecord,
        final_error: String,
        category: ErrorCategory,
        failed_by: WorkerId,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_id: task.id,
            task_type: task.task_type.clone(),
            payload: task.payload.clone(),
            priority: task.priority,
            final_error,
            category,
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            failed_at,
            failed_by,
            task_created_at: task.created_at,
        }
    }

    /// Request for the fresh task created on replay.
    ///
    /// Keeps type, payload, priority and retry budget; drops the idempotency
    /// key so the replay is not deduplicated against the original.
    pub fn replay_request(&self) -> NewTask {
        NewTask::new(self.task_type.clone(), self.payload.clone())
            .with_priority(self.priority)
            .with_max_retries(self.max_retries)
    }
}

/// Query filter for `list_dead_letters`. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterFilter {
    pub task_type: Option<TaskType>,
    pub category: Option<ErrorCategory>,
    pub failed_after: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl DeadLetterFilter {
    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        self.task_type.as_ref().is_none_or(|t| *t == entry.task_type)
            && self.category.is_none_or(|c| c == entry.category)
            && self.failed_after.is_none_or(|at| entry.failed_at > at)
    }

    pub fn with_task_type(mut self, task_type: impl Into<TaskType>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
