//! Decisions: what happens to a task after a failed attempt.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::failure::ErrorCategory;
use super::ids::DeadLetterId;

/// Output of the retry scheduler. Pure value; applying it is the task
/// queue's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the task back to pending after `delay`, consuming one retry.
    Retry { delay: Duration },
    /// Stop retrying and dead-letter the task.
    GiveUp { reason: GiveUpReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GiveUpReason {
    /// The category is never retried.
    NotRetryable,
    /// `retry_count + 1 > max_retries`.
    BudgetExhausted,
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }
}

/// Result of resolving a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to pending with backoff; one retry consumed.
    Rescheduled {
        delay: Duration,
        retry_count: u32,
        category: ErrorCategory,
    },
    /// Moved to the dead-letter store.
    DeadLettered {
        dead_letter_id: DeadLetterId,
        category: ErrorCategory,
        reason: GiveUpReason,
    },
    /// Breaker refused the call; back to pending without consuming a retry.
    Released { delay: Duration },
}
