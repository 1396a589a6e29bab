//! Retry module: error classification, backoff policy, retry decisions.

mod classifier;
mod policy;
mod scheduler;

pub use classifier::ErrorClassifier;
pub use policy::RetryPolicy;
pub use scheduler::RetryScheduler;
