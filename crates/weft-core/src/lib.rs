//! weft-core
//!
//! 耐久性のあるタスク実行ランタイムの中核部品
//! - 二重 claim の起きない TaskStore
//! - 失敗分類と jitter 付きリトライ
//! - 依存先ごとの CircuitBreaker
//! - graceful drain する WorkerLoop
//! - DeadLetterStore と WorkerRegistry
//!
//! # モジュール構成
//! - **domain**: 値型（ID, TaskRecord, TaskFailure, RetryDecision, DomainEvent）
//! - **ports**: 抽象化レイヤー（TaskStore, DeadLetterStore, WorkerRegistry, Clock, EventSink）
//! - **store**: in-memory backend と JSON snapshot
//! - **retry**: ErrorClassifier, RetryPolicy, RetryScheduler
//! - **breaker**: CircuitBreaker, BreakerSet
//! - **typed**: 型付き Task API（Task trait, Handler trait, TypedRegistry）
//! - **app**: TaskQueue, WorkerLoop, ReaperLoop, AppBuilder
//! - **config**, **error**, **observability**: 横断的関心事

pub mod app;
pub mod breaker;
pub mod config;
pub mod domain;
pub mod error;
pub mod observability;
pub mod ports;
pub mod retry;
pub mod store;
pub mod typed;
