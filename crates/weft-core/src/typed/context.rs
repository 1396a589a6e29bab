//! TaskContext - Handler に渡す実行コンテキスト

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::domain::{TaskId, TaskRecord, TaskType, WorkerId};
use crate::ports::Backend;

/// Caller-side rate limit for progress reports.
///
/// A report passes when it is the first one, when it reaches 100, or when
/// `min_interval` has elapsed since the last report that passed.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    min_interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    pub fn should_report(&mut self, percent: u8) -> bool {
        let now = Instant::now();
        let due = match self.last {
            None => true,
            Some(last) => percent >= 100 || now.duration_since(last) >= self.min_interval,
        };
        if due {
            self.last = Some(now);
        }
        due
    }
}

struct ProgressSink {
    store: Arc<dyn Backend>,
    throttle: Mutex<ProgressThrottle>,
}

/// What a handler knows about the execution it is running.
pub struct TaskContext {
    pub task_id: TaskId,
    pub task_type: TaskType,
    /// Retries consumed before this attempt (0 on the first attempt).
    pub retry_count: u32,
    pub worker_id: WorkerId,
    progress: Option<ProgressSink>,
}

impl TaskContext {
    pub fn new(
        record: &TaskRecord,
        worker_id: WorkerId,
        store: Arc<dyn Backend>,
        progress_min_interval: Duration,
    ) -> Self {
        Self {
            task_id: record.id,
            task_type: record.task_type.clone(),
            retry_count: record.retry_count,
            worker_id,
            progress: Some(ProgressSink {
                store,
                throttle: Mutex::new(ProgressThrottle::new(progress_min_interval)),
            }),
        }
    }

    /// Context without a store; progress reports go nowhere. For calling
    /// handlers directly.
    pub fn detached(task_type: impl Into<TaskType>) -> Self {
        Self {
            task_id: TaskId::nil(),
            task_type: task_type.into(),
            retry_count: 0,
            worker_id: WorkerId::new("detached"),
            progress: None,
        }
    }

    /// Record progress on the task (clamped to 0..=100). Throttled, and
    /// never fails the task: store errors are only logged.
    pub async fn report_progress(&self, percent: u8, message: Option<String>) {
        let Some(sink) = &self.progress else {
            return;
        };
        let due = sink
            .throttle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .should_report(percent);
        if !due {
            return;
        }
        if let Err(e) = sink
            .store
            .report_progress(self.task_id, &self.worker_id, percent.min(100), message)
            .await
        {
            debug!(task_id = %self.task_id, error = %e, "progress report dropped");
        }
    }
}
