//! Handler trait - Task を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<T, H> → DynHandler、payload の decode もここ)

use std::marker::PhantomData;

use async_trait::async_trait;

use super::context::TaskContext;
use super::task::Task;
use crate::domain::TaskFailure;

/// Successful result of one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOutput {
    /// Short human-readable summary, kept on the completed record.
    pub summary: Option<String>,
}

impl TaskOutput {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn with_summary(summary: impl Into<String>) -> Self {
        Self {
            summary: Some(summary.into()),
        }
    }
}

/// Handler は `T` を実行して成功か `TaskFailure` を返す
///
/// # 使用例
/// ```ignore
/// struct SendEmailHandler;
///
/// #[async_trait]
/// impl Handler<SendEmail> for SendEmailHandler {
///     async fn handle(&self, task: SendEmail, _ctx: &TaskContext) -> Result<TaskOutput, TaskFailure> {
///         smtp_send(&task.to).await.map_err(|e| TaskFailure::connection(e.to_string()))?;
///         Ok(TaskOutput::done())
///     }
///
///     fn dependency(&self) -> Option<&str> {
///         Some("smtp")
///     }
/// }
/// ```
///
/// # 冪等性
/// リトライや worker 死亡後の reclaim で、同じ task が複数回実行され得ます。
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T, ctx: &TaskContext) -> Result<TaskOutput, TaskFailure>;

    /// Key of the external dependency this handler calls. When set, every
    /// execution runs under that dependency's circuit breaker.
    fn dependency(&self) -> Option<&str> {
        None
    }
}

/// DynHandler は object-safe な Handler の抽象化
///
/// `HashMap<String, Arc<dyn DynHandler>>` に格納可能にします。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<TaskOutput, TaskFailure>;

    fn task_type(&self) -> &str;

    fn dependency(&self) -> Option<&str>;

    fn max_retries(&self) -> Option<u32>;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<TaskOutput, TaskFailure> {
        // a payload that does not decode will never decode
        let task: T = serde_json::from_value(payload)
            .map_err(|e| TaskFailure::invalid_input(format!("json decode: {e}")))?;
        self.handler.handle(task, ctx).await
    }

    fn task_type(&self) -> &str {
        T::TYPE
    }

    fn dependency(&self) -> Option<&str> {
        self.handler.dependency()
    }

    fn max_retries(&self) -> Option<u32> {
        T::MAX_RETRIES
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::typed::task::fixtures::{AnotherTestTask, TestTask};

    pub struct TestTaskHandler;

    #[async_trait]
    impl Handler<TestTask> for TestTaskHandler {
        async fn handle(&self, task: TestTask, _ctx: &TaskContext) -> Result<TaskOutput, TaskFailure> {
            if task.value < 0 {
                return Err(TaskFailure::invalid_input("value must not be negative"));
            }
            Ok(TaskOutput::with_summary(format!("value={}", task.value)))
        }
    }

    pub struct AnotherTestTaskHandler;

    #[async_trait]
    impl Handler<AnotherTestTask> for AnotherTestTaskHandler {
        async fn handle(
            &self,
            _task: AnotherTestTask,
            _ctx: &TaskContext,
        ) -> Result<TaskOutput, TaskFailure> {
            Ok(TaskOutput::done())
        }

        fn dependency(&self) -> Option<&str> {
            Some("family-registry")
        }
    }
}
