//! IdGenerator port - ID の生成
//!
//! # 実装
//! - **UlidGenerator**: 注入された clock の時刻 + 80 bit の乱数による ULID

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::{DeadLetterId, TaskId};
use crate::ports::Clock;

/// Generates IDs that are unique across worker processes without
/// coordination.
pub trait IdGenerator: Send + Sync {
    fn task_id(&self) -> TaskId;

    fn dead_letter_id(&self) -> DeadLetterId;
}

/// ULID-based generator.
///
/// The timestamp part comes from the clock, so a `FixedClock` gives IDs that
/// share a timestamp but still differ in their random part.
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl IdGenerator for UlidGenerator {
    fn task_id(&self) -> TaskId {
        TaskId::from_ulid(self.next())
    }

    fn dead_letter_id(&self) -> DeadLetterId {
        DeadLetterId::from_ulid(self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(Arc::new(SystemClock));

        let id1 = id_gen.task_id();
        let id2 = id_gen.task_id();
        let id3 = id_gen.task_id();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn ulid_generator_with_fixed_clock_shares_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(Arc::new(FixedClock::new(fixed_time)));

        let id1 = id_gen.task_id();
        let id2 = id_gen.task_id();
        assert_ne!(id1, id2);

        assert_eq!(id1.as_ulid().timestamp_ms(), id2.as_ulid().timestamp_ms());
        assert_eq!(
            id1.as_ulid().timestamp_ms(),
            fixed_time.timestamp_millis() as u64
        );
    }

    #[test]
    fn dead_letter_ids_have_their_own_prefix() {
        let id_gen = UlidGenerator::new(Arc::new(SystemClock));
        assert!(id_gen.task_id().to_string().starts_with("task-"));
        assert!(id_gen.dead_letter_id().to_string().starts_with("dlq-"));
    }
}
