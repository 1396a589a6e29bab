//! ErrorClassifier: `TaskFailure -> ErrorCategory`
//!
//! ルール（最初に一致したものを採用）:
//! 1. 明示的な failure kind
//! 2. プロトコルのステータス（429 / 5xx / 4xx）
//! 3. メッセージのヒューリスティクス
//! 4. `Unknown`

use crate::domain::{ErrorCategory, FailureKind, TaskFailure};

const TRANSIENT_HINTS: &[&str] = &[
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "connection closed",
    "broken pipe",
    "temporarily unavailable",
    "service unavailable",
    "try again",
    "deadlock",
];

const RATE_LIMIT_HINTS: &[&str] = &["too many requests", "rate limit", "throttl"];

const PERMANENT_HINTS: &[&str] = &[
    "invalid",
    "malformed",
    "not found",
    "unauthorized",
    "forbidden",
    "permission denied",
    "unsupported",
];

/// Total classification function. Never fails.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    _priv: (),
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&self, failure: &TaskFailure) -> ErrorCategory {
        Self::by_kind(failure.kind)
            .or_else(|| failure.status.and_then(Self::by_status))
            .or_else(|| Self::by_message(&failure.message))
            .unwrap_or(ErrorCategory::Unknown)
    }

    fn by_kind(kind: FailureKind) -> Option<ErrorCategory> {
        match kind {
            FailureKind::Connection | FailureKind::Timeout | FailureKind::ResourceExhausted => {
                Some(ErrorCategory::Transient)
            }
            FailureKind::RateLimited => Some(ErrorCategory::RateLimited),
            FailureKind::InvalidInput => Some(ErrorCategory::Permanent),
            FailureKind::Defect => Some(ErrorCategory::CodeDefect),
            // breaker-open is resolved before classification; if one slips
            // through, it is a dependency health signal
            FailureKind::BreakerOpen => Some(ErrorCategory::Transient),
            FailureKind::Other => None,
        }
    }

    fn by_status(status: u16) -> Option<ErrorCategory> {
        match status {
            429 => Some(ErrorCategory::RateLimited),
            408 => Some(ErrorCategory::Transient),
            500..=599 => Some(ErrorCategory::Transient),
            400..=499 => Some(ErrorCategory::Permanent),
            _ => None,
        }
    }

    fn by_message(message: &str) -> Option<ErrorCategory> {
        let lower = message.to_ascii_lowercase();
        let hit = |hints: &[&str]| hints.iter().any(|h| lower.contains(h));
        if hit(RATE_LIMIT_HINTS) {
            Some(ErrorCategory::RateLimited)
        } else if hit(TRANSIENT_HINTS) {
            Some(ErrorCategory::Transient)
        } else if hit(PERMANENT_HINTS) {
            Some(ErrorCategory::Permanent)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::connection(TaskFailure::connection("refused"), ErrorCategory::Transient)]
    #[case::timeout(TaskFailure::timeout("slow"), ErrorCategory::Transient)]
    #[case::invalid(TaskFailure::invalid_input("bad email"), ErrorCategory::Permanent)]
    #[case::defect(TaskFailure::defect("index out of bounds"), ErrorCategory::CodeDefect)]
    #[case::rate_limited(TaskFailure::rate_limited("slow down", None), ErrorCategory::RateLimited)]
    #[case::status_503(TaskFailure::status(503, "upstream"), ErrorCategory::Transient)]
    #[case::status_429(TaskFailure::status(429, "upstream"), ErrorCategory::RateLimited)]
    #[case::status_404(TaskFailure::status(404, "upstream"), ErrorCategory::Permanent)]
    #[case::status_408(TaskFailure::status(408, "upstream"), ErrorCategory::Transient)]
    #[case::text_reset(TaskFailure::other("Connection reset by peer"), ErrorCategory::Transient)]
    #[case::text_throttle(TaskFailure::other("request throttled"), ErrorCategory::RateLimited)]
    #[case::text_invalid(TaskFailure::other("Invalid account number"), ErrorCategory::Permanent)]
    #[case::nothing(TaskFailure::other("something odd happened"), ErrorCategory::Unknown)]
    fn classifies(#[case] failure: TaskFailure, #[case] expected: ErrorCategory) {
        assert_eq!(ErrorClassifier::new().classify(&failure), expected);
    }

    #[test]
    fn kind_wins_over_status_and_text() {
        let f = TaskFailure {
            status: Some(503),
            ..TaskFailure::invalid_input("timed out while validating")
        };
        assert_eq!(ErrorClassifier::new().classify(&f), ErrorCategory::Permanent);
    }

    #[test]
    fn status_wins_over_text() {
        let f = TaskFailure::status(500, "invalid response body");
        assert_eq!(ErrorClassifier::new().classify(&f), ErrorCategory::Transient);
    }

    #[test]
    fn informational_status_falls_through_to_text() {
        let f = TaskFailure::status(302, "redirect loop, try again");
        assert_eq!(ErrorClassifier::new().classify(&f), ErrorCategory::Transient);
    }
}
