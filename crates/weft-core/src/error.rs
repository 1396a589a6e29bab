use thiserror::Error;

use crate::domain::{DeadLetterId, TaskId, TaskStatus, WorkerId};

/// Errors from task store, dead-letter store and worker registry operations.
///
/// Only `Unavailable` is an infrastructure failure; callers retry the whole
/// operation on it. Everything else is a definite answer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("dead-letter entry {0} not found")]
    DeadLetterNotFound(DeadLetterId),

    #[error("worker {0} is not registered")]
    WorkerNotFound(WorkerId),

    #[error("task {task_id} is not claimed by {worker_id}")]
    NotClaimant { task_id: TaskId, worker_id: WorkerId },

    #[error("task {task_id} cannot {action} while {status:?}")]
    InvalidTransition {
        task_id: TaskId,
        status: TaskStatus,
        action: &'static str,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("snapshot: {0}")]
    Snapshot(String),

    #[error("state file {0} is in use by another process")]
    StateLocked(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(StoreError::Unavailable("db down".into()).is_retryable());
        assert!(!StoreError::InvalidArgument("batch_size".into()).is_retryable());
        assert!(!StoreError::Snapshot("eof".into()).is_retryable());
    }
}
