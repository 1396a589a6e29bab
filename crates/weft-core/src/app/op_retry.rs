//! 不安定な backend に対する store 操作の有限回リトライ

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::StoreError;

/// Run `op` up to `attempts` times, sleeping `base * 2^n` between attempts.
///
/// Only `StoreError::is_retryable` errors are retried; anything else is
/// returned as-is on the first occurrence.
pub async fn retry_store_op<T, F, Fut>(
    attempts: u32,
    base: Duration,
    op_name: &'static str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < attempts => {
                let delay = base.saturating_mul(1u32 << (attempt - 1).min(16));
                warn!(op = op_name, attempt, error = %e, "store operation failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskId;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_unavailable_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_store_op(3, Duration::from_millis(10), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::Unavailable("down".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_attempt_limit() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_store_op(2, Duration::from_millis(10), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("down".into()))
        })
        .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn logical_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_store_op(5, Duration::from_millis(10), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::TaskNotFound(TaskId::nil()))
        })
        .await;
        assert!(matches!(result, Err(StoreError::TaskNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
