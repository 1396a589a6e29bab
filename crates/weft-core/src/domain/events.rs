//! Domain events emitted by the task queue and the background loops.

use std::time::Duration;

use serde::Serialize;

use super::failure::ErrorCategory;
use super::ids::{DeadLetterId, TaskId, WorkerId};
use super::task::{Priority, TaskType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    TaskSubmitted {
        task_id: TaskId,
        task_type: TaskType,
        priority: Priority,
    },
    TaskClaimed {
        task_id: TaskId,
        worker_id: WorkerId,
    },
    TaskCompleted {
        task_id: TaskId,
        worker_id: WorkerId,
    },
    TaskRescheduled {
        task_id: TaskId,
        category: ErrorCategory,
        retry_count: u32,
        #[serde(with = "crate::config::duration_ms")]
        delay: Duration,
    },
    TaskReleased {
        task_id: TaskId,
        #[serde(with = "crate::config::duration_ms")]
        delay: Duration,
    },
    TaskDeadLettered {
        task_id: TaskId,
        dead_letter_id: DeadLetterId,
        category: ErrorCategory,
    },
    /// High-priority operator alert, distinct from ordinary dead-letters.
    CodeDefectAlert {
        task_id: TaskId,
        task_type: TaskType,
        error: String,
    },
    TaskReclaimed {
        task_id: TaskId,
    },
    TaskReplayed {
        dead_letter_id: DeadLetterId,
        new_task_id: TaskId,
    },
    TasksPromoted {
        count: usize,
    },
    WorkerEvicted {
        worker_id: WorkerId,
    },
}
