//! Pending index: claim order of every pending task.

use std::cmp::Reverse;

use chrono::{DateTime, Utc};

use crate::domain::{Priority, TaskId, TaskRecord};

/// Sort key of one pending task.
///
/// Derived `Ord` compares fields in order: priority descending (via
/// `Reverse`), then scheduled_at ascending, then id for a total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct PendingKey {
    pub priority: Reverse<Priority>,
    pub scheduled_at: DateTime<Utc>,
    pub task_id: TaskId,
}

impl PendingKey {
    pub fn of(record: &TaskRecord) -> Self {
        Self {
            priority: Reverse(record.priority),
            scheduled_at: record.scheduled_at,
            task_id: record.id,
        }
    }

    /// Smallest key of a priority band.
    pub fn band_start(priority: Priority) -> Self {
        Self {
            priority: Reverse(priority),
            scheduled_at: DateTime::<Utc>::MIN_UTC,
            task_id: TaskId::nil(),
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use ulid::Ulid;

    fn key(priority: u8, secs: i64) -> PendingKey {
        PendingKey {
            priority: Reverse(Priority::new(priority).unwrap()),
            scheduled_at: DateTime::from_timestamp(secs, 0).unwrap(),
            task_id: TaskId::from_ulid(Ulid::new()),
        }
    }

    #[test]
    fn orders_by_priority_then_schedule() {
        let set: BTreeSet<_> = [key(5, 10), key(9, 50), key(5, 1), key(9, 20)]
            .into_iter()
            .collect();
        let order: Vec<(u8, i64)> = set
            .iter()
            .map(|k| (k.priority().value(), k.scheduled_at.timestamp()))
            .collect();
        assert_eq!(order, vec![(9, 20), (9, 50), (5, 1), (5, 10)]);
    }

    #[test]
    fn band_start_precedes_every_key_of_its_band() {
        let k = key(5, 0);
        let start = PendingKey::band_start(Priority::new(5).unwrap());
        assert!(start < k);
        assert!(key(6, 1_000_000) < start);
    }
}
