//! Task record: the unit stored, claimed and resolved by the task store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{TaskId, WorkerId};

/// Tag selecting a handler. Naming convention: `{namespace}.{domain}.{action}.v{major}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Small bounded urgency. Higher is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

#[derive(Debug, thiserror::Error)]
#[error("priority {0} is out of range 0..={max}", max = Priority::MAX.0)]
pub struct PriorityOutOfRange(pub u8);

impl Priority {
    pub const MIN: Priority = Priority(0);
    pub const MAX: Priority = Priority(10);
    pub const DEFAULT: Priority = Priority(5);

    pub fn new(value: u8) -> Result<Self, PriorityOutOfRange> {
        if value > Self::MAX.0 {
            return Err(PriorityOutOfRange(value));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// The next band down, if any.
    pub fn lower(self) -> Option<Priority> {
        self.0.checked_sub(1).map(Priority)
    }

    /// Raise by `step`, never above `cap` (nor above `MAX`).
    pub fn raised(self, step: u8, cap: Priority) -> Priority {
        let cap = cap.min(Self::MAX);
        if self >= cap {
            return self;
        }
        Priority(self.0.saturating_add(step).min(cap.0))
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u8> for Priority {
    type Error = PriorityOutOfRange;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Task lifecycle status.
///
/// - Pending -> Processing -> Completed
/// - Pending -> Processing -> Pending (retry / reclaim / breaker release)
/// - Pending -> Processing -> Failed (dead-lettered)
///
/// `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Last progress report of a running task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub percent: u8,
    pub message: Option<String>,
    pub reported_at: DateTime<Utc>,
}

/// Producer-side request for a new task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    /// `None` falls back to the per-type (or global) default.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl NewTask {
    pub fn new(task_type: impl Into<TaskType>, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            priority: Priority::DEFAULT,
            max_retries: None,
            idempotency_key: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Single source of truth for one task.
///
/// All status changes go through the transition methods below; the store
/// keeps its indexes in step with them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    /// Not eligible for claim before this instant.
    pub scheduled_at: DateTime<Utc>,
    pub claimed_by: Option<WorkerId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub progress: Option<Progress>,
    #[serde(default)]
    pub result_summary: Option<String>,
}

impl TaskRecord {
    pub fn new(id: TaskId, request: NewTask, max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            task_type: request.task_type,
            payload: request.payload,
            priority: request.priority,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries,
            last_error: None,
            scheduled_at: now,
            claimed_by: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
            idempotency_key: request.idempotency_key,
            progress: None,
            result_summary: None,
        }
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.scheduled_at <= now
    }

    pub fn is_claimed_by(&self, worker_id: &WorkerId) -> bool {
        self.status == TaskStatus::Processing && self.claimed_by.as_ref() == Some(worker_id)
    }

    /// Retries left before the budget is exhausted.
    pub fn retries_remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }

    /// Pending -> Processing.
    pub fn claim(&mut self, worker_id: WorkerId, now: DateTime<Utc>) {
        self.status = TaskStatus::Processing;
        self.claimed_by = Some(worker_id);
        self.claimed_at = Some(now);
        self.progress = None;
        self.updated_at = now;
    }

    /// Processing -> Completed.
    pub fn complete(&mut self, result_summary: Option<String>, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.result_summary = result_summary;
        self.clear_claim();
        self.updated_at = now;
    }

    /// Processing -> Pending, consuming one retry.
    ///
    /// `scheduled_at` never moves backwards.
    pub fn schedule_retry(&mut self, next_run_at: DateTime<Utc>, error: String, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.retry_count += 1;
        self.scheduled_at = self.scheduled_at.max(next_run_at);
        self.last_error = Some(error);
        self.clear_claim();
        self.updated_at = now;
    }

    /// Processing -> Pending without consuming a retry (worker died, breaker open).
    pub fn release(&mut self, next_run_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.scheduled_at = self.scheduled_at.max(next_run_at);
        self.clear_claim();
        self.updated_at = now;
    }

    /// Processing -> Failed. The store moves the record into the dead-letter
    /// store in the same unit of work.
    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.last_error = Some(error);
        self.clear_claim();
        self.updated_at = now;
    }

    fn clear_claim(&mut self) {
        self.claimed_by = None;
        self.claimed_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ulid::Ulid;

    fn record(now: DateTime<Utc>) -> TaskRecord {
        TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            NewTask::new("test.task.v1", serde_json::json!({"k": 1})),
            3,
            now,
        )
    }

    #[test]
    fn priority_is_bounded() {
        assert!(Priority::new(10).is_ok());
        assert!(Priority::new(11).is_err());
        assert_eq!(Priority::MIN.lower(), None);
        assert_eq!(Priority::new(3).unwrap().lower(), Some(Priority::new(2).unwrap()));
    }

    #[test]
    fn priority_raise_respects_cap() {
        let p = Priority::new(4).unwrap();
        let cap = Priority::new(7).unwrap();
        assert_eq!(p.raised(2, cap).value(), 6);
        assert_eq!(p.raised(5, cap).value(), 7);
        assert_eq!(Priority::new(8).unwrap().raised(1, cap).value(), 8);
    }

    #[test]
    fn priority_rejects_out_of_range_on_deserialize() {
        assert!(serde_json::from_str::<Priority>("11").is_err());
        assert_eq!(serde_json::from_str::<Priority>("9").unwrap().value(), 9);
    }

    #[test]
    fn claim_sets_claim_fields_and_release_clears_them() {
        let now = Utc::now();
        let mut r = record(now);
        let worker = WorkerId::new("w1");

        r.claim(worker.clone(), now);
        assert!(r.is_claimed_by(&worker));
        assert_eq!(r.claimed_at, Some(now));

        r.release(now, now);
        assert_eq!(r.status, TaskStatus::Pending);
        assert!(r.claimed_by.is_none());
        assert!(r.claimed_at.is_none());
        assert_eq!(r.retry_count, 0);
    }

    #[test]
    fn schedule_retry_increments_and_never_moves_backwards() {
        let now = Utc::now();
        let mut r = record(now);
        r.claim(WorkerId::new("w1"), now);
        r.schedule_retry(now + Duration::seconds(10), "boom".into(), now);
        assert_eq!(r.retry_count, 1);
        assert_eq!(r.scheduled_at, now + Duration::seconds(10));
        assert_eq!(r.last_error.as_deref(), Some("boom"));

        r.claim(WorkerId::new("w1"), now);
        r.schedule_retry(now + Duration::seconds(1), "again".into(), now);
        assert_eq!(r.scheduled_at, now + Duration::seconds(10));
        assert_eq!(r.retries_remaining(), 1);
    }

    #[test]
    fn eligibility_depends_on_status_and_schedule() {
        let now = Utc::now();
        let mut r = record(now);
        assert!(r.is_eligible(now));
        r.scheduled_at = now + Duration::seconds(1);
        assert!(!r.is_eligible(now));
        r.scheduled_at = now;
        r.claim(WorkerId::new("w"), now);
        assert!(!r.is_eligible(now));
    }
}
