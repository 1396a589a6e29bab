//! App - アプリケーション層
//!
//! ports を組み合わせて実行中のシステムを構成します。
//!
//! # コンポーネント
//! - **AppBuilder**: ワイヤリングと起動時検証
//! - **TaskQueue**: submit / claim / resolve の窓口、失敗処理
//! - **WorkerLoop**: claim → execute → resolve、graceful drain
//! - **HeartbeatLoop**: worker の生存通知
//! - **ReaperLoop**: stuck task の回収、dead worker の掃除、昇格
//! - **WorkerGroup**: 1 プロセス内の複数 worker

pub mod builder;
pub mod group;
pub mod heartbeat;
pub mod op_retry;
pub mod queue;
pub mod reaper_loop;
pub mod shutdown;
pub mod worker_loop;

pub use self::builder::{App, AppBuilder, BuildError};
pub use self::group::WorkerGroup;
pub use self::heartbeat::HeartbeatLoop;
pub use self::queue::TaskQueue;
pub use self::reaper_loop::{ReaperLoop, SweepReport};
pub use self::shutdown::{ShutdownController, ShutdownSignal, shutdown_channel};
pub use self::worker_loop::{WorkerLoop, WorkerReport};
