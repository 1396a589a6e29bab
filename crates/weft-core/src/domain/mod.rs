//! Domain model（ID, TaskRecord, 失敗, decision, イベント）

pub mod dead_letter;
pub mod decision;
pub mod events;
pub mod failure;
pub mod ids;
pub mod task;
pub mod worker;

pub use dead_letter::{DeadLetterEntry, DeadLetterFilter};
pub use decision::{FailOutcome, GiveUpReason, RetryDecision};
pub use events::DomainEvent;
pub use failure::{ErrorCategory, FailureKind, TaskFailure};
pub use ids::{DeadLetterId, TaskId, WorkerId};
pub use task::{NewTask, Priority, Progress, TaskRecord, TaskStatus, TaskType};
pub use worker::WorkerInfo;
