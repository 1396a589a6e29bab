//! CircuitBreaker - 外部依存先ごとの遮断器
//!
//! - Closed: 呼び出しを通し、連続失敗を数える
//! - Open: 最後の失敗から `recovery_timeout` が経つまで即座に拒否
//! - HalfOpen: trial call を 1 件だけ通し、その結果で Closed か Open に戻る
//!
//! 数えるのは依存先の失敗（と timeout）だけで、それ以外は成功扱いです。

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::duration_ms;
use crate::domain::TaskFailure;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip a closed breaker.
    pub failure_threshold: u32,
    #[serde(with = "duration_ms")]
    pub recovery_timeout: Duration,
    /// Upper bound for one guarded call; exceeding it is a failure.
    #[serde(with = "duration_ms")]
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, call_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            call_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Refused without calling the operation.
    #[error("circuit breaker for '{key}' is open")]
    Open { key: String },

    #[error("call to '{key}' timed out after {after:?}")]
    Timeout { key: String, after: Duration },

    #[error(transparent)]
    Inner(E),
}

impl From<BreakerError<TaskFailure>> for TaskFailure {
    fn from(err: BreakerError<TaskFailure>) -> Self {
        match err {
            BreakerError::Open { key } => TaskFailure::breaker_open(key),
            BreakerError::Timeout { key, after } => {
                TaskFailure::timeout(format!("call exceeded {after:?}")).with_dependency(key)
            }
            BreakerError::Inner(failure) => failure,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    phase: BreakerPhase,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            state: Mutex::new(BreakerState {
                phase: BreakerPhase::Closed,
                consecutive_failures: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current phase. An open breaker whose recovery timeout elapsed still
    /// reports `Open` until the next call moves it to half-open.
    pub fn phase(&self) -> BreakerPhase {
        self.lock().phase
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Run `op` under the breaker; every `Err` is a dependency failure.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_classified(op, |_| true).await
    }

    /// Run `op` under the breaker. `is_failure` decides whether an error
    /// says something about the dependency's health; errors for which it
    /// returns false are passed through and count as success.
    pub async fn execute_classified<F, Fut, T, E, C>(
        &self,
        op: F,
        is_failure: C,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> bool,
    {
        let Some(permit) = self.admit() else {
            return Err(BreakerError::Open {
                key: self.key.clone(),
            });
        };

        match tokio::time::timeout(self.config.call_timeout, op()).await {
            Err(_elapsed) => {
                permit.settle(true);
                Err(BreakerError::Timeout {
                    key: self.key.clone(),
                    after: self.config.call_timeout,
                })
            }
            Ok(Ok(value)) => {
                permit.settle(false);
                Ok(value)
            }
            Ok(Err(err)) => {
                permit.settle(is_failure(&err));
                Err(BreakerError::Inner(err))
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self) -> Option<Permit<'_>> {
        let mut state = self.lock();
        let admission = match state.phase {
            BreakerPhase::Closed => Admission::Normal,
            BreakerPhase::Open => {
                let recovered = state
                    .last_failure
                    .is_none_or(|at| at.elapsed() >= self.config.recovery_timeout);
                if !recovered {
                    return None;
                }
                info!(dependency = %self.key, "circuit breaker half-open, admitting trial call");
                state.phase = BreakerPhase::HalfOpen;
                state.trial_in_flight = true;
                Admission::Trial
            }
            BreakerPhase::HalfOpen => {
                if state.trial_in_flight {
                    return None;
                }
                state.trial_in_flight = true;
                Admission::Trial
            }
        };
        Some(Permit {
            breaker: self,
            admission,
            settled: false,
        })
    }

    fn record(&self, admission: Admission, failed: bool) {
        let mut state = self.lock();
        if admission == Admission::Trial {
            state.trial_in_flight = false;
        }

        if !failed {
            match (admission, state.phase) {
                (Admission::Trial, _) => {
                    info!(dependency = %self.key, "circuit breaker closed");
                    state.phase = BreakerPhase::Closed;
                    state.consecutive_failures = 0;
                }
                (Admission::Normal, BreakerPhase::Closed) => state.consecutive_failures = 0,
                // a late success from before the trip proves nothing
                (Admission::Normal, _) => {}
            }
            return;
        }

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure = Some(Instant::now());
        let trip = match admission {
            Admission::Trial => true,
            Admission::Normal => {
                state.phase == BreakerPhase::Closed
                    && state.consecutive_failures >= self.config.failure_threshold
            }
        };
        if trip {
            warn!(
                dependency = %self.key,
                consecutive_failures = state.consecutive_failures,
                "circuit breaker opened"
            );
            state.phase = BreakerPhase::Open;
        }
    }
}

/// Admission ticket of one call. A permit dropped without a result means
/// the caller gave up on the call (an outer timeout or an abort), which is
/// recorded as a failure like any other hang.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, failed: bool) {
        self.settled = true;
        self.breaker.record(self.admission, failed);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(dependency = %self.breaker.key, "guarded call dropped before it finished");
            self.breaker.record(self.admission, true);
        }
    }
}

/// Lazily created breakers keyed by dependency name.
#[derive(Debug, Default)]
pub struct BreakerSet {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerSet {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            breakers
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone()))),
        )
    }

    /// `(key, phase)` of every breaker created so far, sorted by key.
    pub fn phases(&self) -> Vec<(String, BreakerPhase)> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut phases: Vec<_> = breakers
            .iter()
            .map(|(key, breaker)| (key.clone(), breaker.phase()))
            .collect();
        phases.sort_by(|a, b| a.0.cmp(&b.0));
        phases
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "payments",
            BreakerConfig::new(threshold, Duration::from_secs(30), Duration::from_secs(5)),
        )
    }

    async fn fail(b: &CircuitBreaker) -> BreakerError<&'static str> {
        b.execute(|| async { Err::<(), _>("boom") }).await.unwrap_err()
    }

    async fn succeed(b: &CircuitBreaker) -> Result<u32, BreakerError<&'static str>> {
        b.execute(|| async { Ok::<_, &'static str>(7) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_consecutive_failures() {
        let b = breaker(3);
        for _ in 0..2 {
            assert!(matches!(fail(&b).await, BreakerError::Inner("boom")));
        }
        assert_eq!(b.phase(), BreakerPhase::Closed);
        fail(&b).await;
        assert_eq!(b.phase(), BreakerPhase::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_counter() {
        let b = breaker(3);
        fail(&b).await;
        fail(&b).await;
        succeed(&b).await.unwrap();
        assert_eq!(b.consecutive_failures(), 0);
        fail(&b).await;
        fail(&b).await;
        assert_eq!(b.phase(), BreakerPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_fails_fast_without_calling() {
        let b = breaker(1);
        fail(&b).await;

        let calls = AtomicU32::new(0);
        let err = b
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BreakerError::Open { ref key } if key == "payments"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_success_closes() {
        let b = breaker(1);
        fail(&b).await;
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(succeed(&b).await.unwrap(), 7);
        assert_eq!(b.phase(), BreakerPhase::Closed);
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_and_restarts_the_timer() {
        let b = breaker(1);
        fail(&b).await;
        tokio::time::advance(Duration::from_secs(31)).await;
        fail(&b).await;
        assert_eq!(b.phase(), BreakerPhase::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(matches!(succeed(&b).await, Err(BreakerError::Open { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_trial_call_at_a_time() {
        let b = Arc::new(breaker(1));
        fail(&b).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let b = Arc::clone(&b);
            tokio::spawn(async move {
                b.execute(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, &'static str>(1)
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(b.phase(), BreakerPhase::HalfOpen);
        assert!(matches!(succeed(&b).await, Err(BreakerError::Open { .. })));

        release_tx.send(()).unwrap();
        assert_eq!(trial.await.unwrap().unwrap(), 1);
        assert_eq!(b.phase(), BreakerPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_trial_reopens() {
        let b = breaker(1);
        fail(&b).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        let never = b.execute(|| std::future::pending::<Result<(), &'static str>>());
        let _ = tokio::time::timeout(Duration::from_millis(10), never).await;
        assert_eq!(b.phase(), BreakerPhase::Open);
        assert!(matches!(succeed(&b).await, Err(BreakerError::Open { .. })));

        tokio::time::advance(Duration::from_secs(31)).await;
        succeed(&b).await.unwrap();
        assert_eq!(b.phase(), BreakerPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn hang_cut_short_by_an_outer_timeout_counts_as_failure() {
        let b = CircuitBreaker::new(
            "payments",
            BreakerConfig::new(1, Duration::from_secs(30), Duration::from_secs(600)),
        );
        let never = b.execute(|| std::future::pending::<Result<(), &'static str>>());
        assert!(tokio::time::timeout(Duration::from_secs(300), never).await.is_err());

        assert_eq!(b.consecutive_failures(), 1);
        assert_eq!(b.phase(), BreakerPhase::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn default_threshold_opens_on_the_fifth_failure() {
        let b = CircuitBreaker::new("payments", BreakerConfig::default());
        for _ in 0..4 {
            fail(&b).await;
        }
        assert_eq!(b.phase(), BreakerPhase::Closed);
        fail(&b).await;
        assert_eq!(b.phase(), BreakerPhase::Open);

        let calls = AtomicU32::new(0);
        let err = b
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BreakerError::Open { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure() {
        let b = breaker(1);
        let err = b
            .execute(|| std::future::pending::<Result<(), &'static str>>())
            .await
            .unwrap_err();
        assert!(matches!(err, BreakerError::Timeout { .. }));
        assert_eq!(b.phase(), BreakerPhase::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn non_dependency_errors_do_not_trip() {
        let b = breaker(1);
        for _ in 0..5 {
            let err = b
                .execute_classified(|| async { Err::<(), _>("bad input") }, |_| false)
                .await
                .unwrap_err();
            assert!(matches!(err, BreakerError::Inner("bad input")));
        }
        assert_eq!(b.phase(), BreakerPhase::Closed);
    }

    #[test]
    fn breaker_set_shares_one_breaker_per_key() {
        let set = BreakerSet::new(BreakerConfig::default());
        let a = set.get("smtp");
        let b = set.get("smtp");
        assert!(Arc::ptr_eq(&a, &b));
        set.get("billing");
        assert_eq!(
            set.phases(),
            vec![
                ("billing".to_string(), BreakerPhase::Closed),
                ("smtp".to_string(), BreakerPhase::Closed),
            ]
        );
    }

    #[test]
    fn breaker_errors_convert_into_task_failures() {
        use crate::domain::FailureKind;

        let open: TaskFailure = BreakerError::<TaskFailure>::Open { key: "smtp".into() }.into();
        assert_eq!(open.kind, FailureKind::BreakerOpen);
        assert_eq!(open.dependency.as_deref(), Some("smtp"));

        let timeout: TaskFailure = BreakerError::<TaskFailure>::Timeout {
            key: "smtp".into(),
            after: Duration::from_secs(1),
        }
        .into();
        assert_eq!(timeout.kind, FailureKind::Timeout);
    }
}
