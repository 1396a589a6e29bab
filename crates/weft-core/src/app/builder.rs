//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: 設定の矛盾と Handler 不足は `build()` で検出
//! - `Arc<dyn Backend>` による backend の差し替え

use std::sync::Arc;

use super::group::WorkerGroup;
use super::queue::TaskQueue;
use super::reaper_loop::ReaperLoop;
use super::worker_loop::WorkerLoop;
use crate::breaker::BreakerSet;
use crate::config::{ConfigError, WeftConfig};
use crate::ports::{Backend, EventSink, NoopEventSink};
use crate::store::InMemoryTaskStore;
use crate::typed::{Handler, RegistryError, Task, TypedRegistry};

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .register::<SendEmail, _>(SendEmailHandler)?
///     .expect_tasks(&["acme.mail.send.v1"])
///     .with_config(WeftConfig::load("weft.json")?)
///     .build()?;
///
/// let workers = app.spawn_workers(4);
/// ```
///
/// # Fail-fast 設計
/// - `build()` 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 設定値の矛盾は `WeftConfig::validate` で検出
/// - 不足や矛盾があれば BuildError を返す
pub struct AppBuilder {
    registry: TypedRegistry,
    expected_tasks: Option<Vec<String>>,
    config: WeftConfig,
    backend: Option<Arc<dyn Backend>>,
    events: Arc<dyn EventSink>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: TypedRegistry::new(),
            expected_tasks: None,
            config: WeftConfig::default(),
            backend: None,
            events: Arc::new(NoopEventSink),
        }
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn with_config(mut self, config: WeftConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to a fresh `InMemoryTaskStore`.
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        self.config.validate()?;

        if let Some(expected_tasks) = &self.expected_tasks {
            let registered_types = self.registry.registered_types();
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|x| !registered_types.contains(x))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }

        let backend: Arc<dyn Backend> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(InMemoryTaskStore::new()),
        };
        let queue = TaskQueue::new(backend, self.config.retry.clone())
            .with_retry_budgets(self.registry.retry_budgets())
            .with_release_delay(self.config.worker.breaker_release_delay)
            .with_event_sink(self.events);

        Ok(App {
            queue: Arc::new(queue),
            registry: Arc::new(self.registry),
            config: self.config,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A wired application: shared queue plus the handlers workers run.
pub struct App {
    pub queue: Arc<TaskQueue>,
    pub registry: Arc<TypedRegistry>,
    pub config: WeftConfig,
}

impl App {
    /// One worker with its own breakers, configured from `config.worker`.
    pub fn worker(&self) -> WorkerLoop {
        WorkerLoop::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.registry),
            Arc::new(BreakerSet::new(self.config.breaker.clone())),
            self.config.worker.clone(),
        )
    }

    pub fn reaper(&self) -> ReaperLoop {
        ReaperLoop::new(Arc::clone(&self.queue), self.config.reaper.clone())
    }

    pub fn spawn_workers(&self, n: usize) -> WorkerGroup {
        WorkerGroup::spawn(
            n,
            Arc::clone(&self.queue),
            Arc::clone(&self.registry),
            self.config.breaker.clone(),
            self.config.worker.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskType;
    use crate::ports::TaskView;
    use crate::typed::handler::fixtures::{AnotherTestTaskHandler, TestTaskHandler};
    use crate::typed::task::fixtures::{AnotherTestTask, TestTask};
    use std::collections::HashMap;

    #[test]
    fn test_build_success() {
        let app = AppBuilder::new()
            .register::<TestTask, _>(TestTaskHandler)
            .unwrap()
            .expect_tasks(&[TestTask::TYPE])
            .build();
        assert!(app.is_ok());
    }

    #[test]
    fn test_build_missing_task_types() {
        let app = AppBuilder::new()
            .register::<TestTask, _>(TestTaskHandler)
            .unwrap()
            .expect_tasks(&[TestTask::TYPE, AnotherTestTask::TYPE])
            .build();
        assert!(matches!(
            app,
            Err(BuildError::MissingTaskTypes(missing)) if missing == vec![AnotherTestTask::TYPE.to_string()]
        ));
    }

    #[test]
    fn test_build_no_expect_tasks() {
        let app = AppBuilder::new()
            .register::<TestTask, _>(TestTaskHandler)
            .unwrap()
            .build();
        assert!(app.is_ok());
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = WeftConfig::default();
        config.worker.batch_size = 0;
        let app = AppBuilder::new().with_config(config).build();
        assert!(matches!(app, Err(BuildError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_declared_retry_budget_applies_to_submissions() {
        let app = AppBuilder::new()
            .register::<AnotherTestTask, _>(AnotherTestTaskHandler)
            .unwrap()
            .build()
            .unwrap();
        let id = app
            .queue
            .submit_typed(&AnotherTestTask {
                name: "x".into(),
                family: HashMap::new(),
            })
            .await
            .unwrap();

        match app.queue.get(id).await.unwrap() {
            Some(TaskView::Active(r)) => {
                assert_eq!(r.task_type, TaskType::new(AnotherTestTask::TYPE));
                assert_eq!(r.max_retries, 1);
            }
            other => panic!("expected active view, got {other:?}"),
        }
    }
}
