//! Task の失敗とその運用上の分類
//!
//! Handler は *何が起きたか* を [`TaskFailure`] で報告し、classifier がそれを
//! [`ErrorCategory`] に変換します。retry scheduler が判断に使うのは後者です。

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the handler knows about the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Could not reach the dependency (refused, reset, DNS, ...).
    Connection,
    /// The operation did not finish within its timeout.
    Timeout,
    /// Out of a local or remote resource (pool, disk, memory, quota).
    ResourceExhausted,
    /// Dependency asked us to slow down.
    RateLimited,
    /// The payload or request is invalid; retrying cannot help.
    InvalidInput,
    /// A bug in the handler (panic, broken invariant, missing handler).
    Defect,
    /// A circuit breaker refused the call. Not a task outcome.
    BreakerOpen,
    /// Nothing more specific is known.
    Other,
}

/// Failure value returned by handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    /// Protocol status code, if the failure came from e.g. an HTTP call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
    /// Server-suggested delay before the next attempt.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::config::duration_ms::option")]
    pub retry_after: Option<Duration>,
    /// Dependency key the failure is attributed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<String>,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            retry_after: None,
            dependency: None,
        }
    }

    /// Failure without any explicit kind; classification falls through to
    /// status code and message heuristics.
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Other, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Connection, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidInput, message)
    }

    pub fn defect(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Defect, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(FailureKind::RateLimited, message)
        }
    }

    pub fn breaker_open(dependency: impl Into<String>) -> Self {
        let dependency = dependency.into();
        Self {
            dependency: Some(dependency.clone()),
            ..Self::new(
                FailureKind::BreakerOpen,
                format!("circuit breaker open for {dependency}"),
            )
        }
    }

    /// Failure carrying a protocol status code (HTTP-like).
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::other(message)
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependency = Some(dependency.into());
        self
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{:?} (status {status}): {}", self.kind, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for TaskFailure {}

/// Operational classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Retry with backoff.
    Transient,
    /// Retry honoring the suggested delay.
    RateLimited,
    /// No retry; dead-letter immediately.
    Permanent,
    /// Treated as permanent, plus an operator alert.
    CodeDefect,
    /// Retry conservatively with a reduced budget.
    Unknown,
}

impl ErrorCategory {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::Transient | ErrorCategory::RateLimited | ErrorCategory::Unknown
        )
    }

    /// Whether this outcome says something about the dependency's health.
    pub fn trips_breaker(self) -> bool {
        matches!(self, ErrorCategory::Transient | ErrorCategory::RateLimited)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::CodeDefect => "code_defect",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
