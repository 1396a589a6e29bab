use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use weft_core::app::{App, AppBuilder, WorkerReport, shutdown_channel};
use weft_core::config::WeftConfig;
use weft_core::domain::{DeadLetterFilter, ErrorCategory, NewTask, Priority, TaskFailure};
use weft_core::ports::TaskView;
use weft_core::retry::RetryPolicy;
use weft_core::typed::{Handler, Task, TaskContext, TaskOutput};

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    label: String,
}

impl Task for Record {
    const TYPE: &'static str = "test.e2e.record.v1";
}

#[derive(Default)]
struct RecordHandler {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl Handler<Record> for Arc<RecordHandler> {
    async fn handle(&self, task: Record, ctx: &TaskContext) -> Result<TaskOutput, TaskFailure> {
        ctx.report_progress(100, Some("recorded".into())).await;
        self.seen
            .lock()
            .unwrap()
            .push(task.label.clone());
        Ok(TaskOutput::with_summary(task.label))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Flaky;

impl Task for Flaky {
    const TYPE: &'static str = "test.e2e.flaky.v1";
}

struct FlakyHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl Handler<Flaky> for Arc<FlakyHandler> {
    async fn handle(&self, _task: Flaky, _ctx: &TaskContext) -> Result<TaskOutput, TaskFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TaskFailure::connection("connection reset by peer"))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Strict;

impl Task for Strict {
    const TYPE: &'static str = "test.e2e.strict.v1";
}

struct StrictHandler {
    reject: AtomicBool,
    calls: AtomicUsize,
}

#[async_trait]
impl Handler<Strict> for Arc<StrictHandler> {
    async fn handle(&self, _task: Strict, _ctx: &TaskContext) -> Result<TaskOutput, TaskFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            return Err(TaskFailure::status(422, "invalid address"));
        }
        Ok(TaskOutput::done())
    }
}

fn fast_config() -> WeftConfig {
    let mut config = WeftConfig::default();
    config.retry = RetryPolicy::new(Duration::from_millis(1), 2.0, Duration::from_millis(10));
    config.worker = config
        .worker
        .with_poll_interval(Duration::from_millis(5), Duration::from_millis(20));
    config
}

/// Run one worker until the queue has nothing left to do.
async fn run_until_idle(app: &App) -> WorkerReport {
    let (controller, signal) = shutdown_channel();
    let worker = tokio::spawn(app.worker().run(signal));
    for _ in 0..500 {
        if app.queue.counts().await.unwrap().active() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    controller.shutdown();
    worker.await.unwrap().unwrap()
}

#[tokio::test]
async fn higher_priority_runs_first() {
    let handler = Arc::new(RecordHandler::default());
    let app = AppBuilder::new()
        .register::<Record, _>(Arc::clone(&handler))
        .unwrap()
        .with_config(fast_config())
        .build()
        .unwrap();

    let submit = |label: &str, priority: u8| {
        let request = Record {
            label: label.to_string(),
        }
        .to_new_task()
        .unwrap()
        .with_priority(Priority::new(priority).unwrap());
        app.queue.submit(request)
    };
    submit("low", 5).await.unwrap();
    let urgent = submit("urgent", 9).await.unwrap();

    let report = run_until_idle(&app).await;

    assert_eq!(report.completed, 2);
    assert_eq!(*handler.seen.lock().unwrap(), vec!["urgent", "low"]);
    match app.queue.get(urgent).await.unwrap() {
        Some(TaskView::Completed(r)) => {
            assert_eq!(r.result_summary.as_deref(), Some("urgent"));
        }
        other => panic!("expected completed view, got {other:?}"),
    }
}

#[tokio::test]
async fn transient_failures_exhaust_the_budget_then_dead_letter() {
    let handler = Arc::new(FlakyHandler {
        calls: AtomicUsize::new(0),
    });
    let app = AppBuilder::new()
        .register::<Flaky, _>(Arc::clone(&handler))
        .unwrap()
        .with_config(fast_config())
        .build()
        .unwrap();

    let id = app
        .queue
        .submit(Flaky.to_new_task().unwrap().with_max_retries(3))
        .await
        .unwrap();
    let report = run_until_idle(&app).await;

    assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
    assert_eq!(report.rescheduled, 3);
    assert_eq!(report.dead_lettered, 1);

    let entries = app
        .queue
        .list_dead_letters(&DeadLetterFilter::default())
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].task_id, id);
    assert_eq!(entries[0].retry_count, 3);
    assert_eq!(entries[0].category, ErrorCategory::Transient);
    assert!(matches!(
        app.queue.get(id).await.unwrap(),
        Some(TaskView::DeadLettered(_))
    ));
}

#[tokio::test]
async fn permanent_failure_dead_letters_on_first_attempt_and_replays() {
    let handler = Arc::new(StrictHandler {
        reject: AtomicBool::new(true),
        calls: AtomicUsize::new(0),
    });
    let app = AppBuilder::new()
        .register::<Strict, _>(Arc::clone(&handler))
        .unwrap()
        .with_config(fast_config())
        .build()
        .unwrap();

    app.queue
        .submit(Strict.to_new_task().unwrap().with_max_retries(5))
        .await
        .unwrap();
    let report = run_until_idle(&app).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.dead_lettered, 1);

    let entry = app
        .queue
        .list_dead_letters(&DeadLetterFilter::default().with_category(ErrorCategory::Permanent))
        .await
        .unwrap()
        .remove(0);
    assert!(entry.final_error.contains("invalid address"));

    // the operator fixed the cause
    handler.reject.store(false, Ordering::SeqCst);
    let replayed = app.queue.replay(entry.id).await.unwrap();
    assert_ne!(replayed, entry.task_id);

    let report = run_until_idle(&app).await;
    assert_eq!(report.completed, 1);
    assert!(matches!(
        app.queue.get(replayed).await.unwrap(),
        Some(TaskView::Completed(_))
    ));
    // the entry itself is untouched
    assert_eq!(
        app.queue.get_dead_letter(entry.id).await.unwrap(),
        Some(entry)
    );
}

#[tokio::test]
async fn idempotent_submission_runs_once() {
    let handler = Arc::new(RecordHandler::default());
    let app = AppBuilder::new()
        .register::<Record, _>(Arc::clone(&handler))
        .unwrap()
        .with_config(fast_config())
        .build()
        .unwrap();

    let request = || {
        NewTask::new(Record::TYPE, serde_json::json!({ "label": "once" }))
            .with_idempotency_key("order-42")
    };
    let first = app.queue.submit(request()).await.unwrap();
    let second = app.queue.submit(request()).await.unwrap();
    assert_eq!(first, second);

    run_until_idle(&app).await;
    assert_eq!(*handler.seen.lock().unwrap(), vec!["once"]);
}
