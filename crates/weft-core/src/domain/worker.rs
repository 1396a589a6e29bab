//! Worker registry rows.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::WorkerId;
use super::task::TaskType;

/// Liveness record of one worker process. Owned by that process; the dead
/// worker sweep may only delete it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    pub capabilities: BTreeSet<TaskType>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Set once shutdown began; the worker claims nothing new.
    pub draining: bool,
}

impl WorkerInfo {
    pub fn new(
        worker_id: WorkerId,
        capabilities: BTreeSet<TaskType>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            worker_id,
            capabilities,
            registered_at: now,
            last_heartbeat: now,
            draining: false,
        }
    }
}
