//! Ports - 抽象化レイヤー
//!
//! 本番とテストで差し替えるものの境界: 共有 store、時刻、ID 生成、イベント配送。

pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, ManualClock, SystemClock};
pub use self::event_sink::{EventSink, MemoryEventSink, NoopEventSink};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{
    Backend, DeadLetterStore, Submission, TaskStore, TaskView, WorkerRegistry,
};
