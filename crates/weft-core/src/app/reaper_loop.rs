//! ReaperLoop - 生存確認の sweep
//!
//! # フロー（`sweep_interval` ごと）
//! 1. `reclaim_stuck`: `stuck_threshold` を超えた Processing → Pending
//! 2. `sweep_dead_workers`: `max_missed` 回分 heartbeat のない worker を削除
//! 3. `promote_aged`: 長く待っている pending task の priority を上げる
//!
//! どのプロセスが実行してもよく、各ステップは冪等です。

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::queue::TaskQueue;
use super::shutdown::ShutdownSignal;
use crate::config::ReaperConfig;
use crate::error::StoreError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: usize,
    pub evicted: usize,
    pub promoted: usize,
}

pub struct ReaperLoop {
    queue: Arc<TaskQueue>,
    config: ReaperConfig,
}

impl ReaperLoop {
    pub fn new(queue: Arc<TaskQueue>, config: ReaperConfig) -> Self {
        Self { queue, config }
    }

    pub async fn run_once(&self) -> Result<SweepReport, StoreError> {
        let reclaimed = self
            .queue
            .reclaim_stuck(self.config.stuck_threshold)
            .await?
            .len();
        let evicted = self
            .queue
            .sweep_dead_workers(
                self.config.heartbeat_interval,
                self.config.max_missed_heartbeats,
            )
            .await?
            .len();
        let promoted = match &self.config.promotion {
            Some(p) => {
                self.queue
                    .promote_aged(p.age_threshold, p.step, p.cap)
                    .await?
            }
            None => 0,
        };
        Ok(SweepReport {
            reclaimed,
            evicted,
            promoted,
        })
    }

    /// Sweep every `sweep_interval` until `shutdown`. A failed sweep is
    /// logged and retried on the next tick.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => match self.run_once().await {
                    Ok(report) => debug!(report = ?report, "sweep finished"),
                    Err(e) => warn!(error = %e, "sweep failed"),
                },
            }
        }
    }
}
