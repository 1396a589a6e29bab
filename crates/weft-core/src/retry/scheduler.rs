//! RetryScheduler - category + リトライ予算 → decision
//!
//! 純粋関数: 現在の状態と観測から次のアクションを返すだけで副作用はありません。
//! decision の適用は TaskQueue の仕事です。

use std::time::Duration;

use rand::Rng;

use super::RetryPolicy;
use crate::domain::{ErrorCategory, GiveUpReason, RetryDecision};

#[derive(Debug, Clone, Default)]
pub struct RetryScheduler {
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decide with the thread-local RNG.
    pub fn decide(
        &self,
        category: ErrorCategory,
        retry_count: u32,
        max_retries: u32,
        suggested_delay: Option<Duration>,
    ) -> RetryDecision {
        self.decide_with_rng(
            category,
            retry_count,
            max_retries,
            suggested_delay,
            &mut rand::thread_rng(),
        )
    }

    pub fn decide_with_rng<R: Rng + ?Sized>(
        &self,
        category: ErrorCategory,
        retry_count: u32,
        max_retries: u32,
        suggested_delay: Option<Duration>,
        rng: &mut R,
    ) -> RetryDecision {
        let budget = match category {
            ErrorCategory::Permanent | ErrorCategory::CodeDefect => {
                return RetryDecision::GiveUp {
                    reason: GiveUpReason::NotRetryable,
                };
            }
            ErrorCategory::Unknown => max_retries.min(self.policy.unknown_max_retries),
            ErrorCategory::Transient | ErrorCategory::RateLimited => max_retries,
        };

        if retry_count.saturating_add(1) > budget {
            return RetryDecision::GiveUp {
                reason: GiveUpReason::BudgetExhausted,
            };
        }

        let delay = match (category, suggested_delay) {
            (ErrorCategory::RateLimited, Some(suggested)) => suggested,
            _ => self.policy.jittered_delay(retry_count, rng),
        };
        RetryDecision::Retry { delay }
    }
}
