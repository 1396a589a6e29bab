mod cli;
mod demo;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;

use weft_core::app::{App, AppBuilder, shutdown_channel};
use weft_core::config::WeftConfig;
use weft_core::domain::{DeadLetterFilter, DeadLetterId, ErrorCategory, NewTask, Priority, TaskId};
use weft_core::observability::{self, LogFormat};
use weft_core::ports::SystemClock;
use weft_core::store::StateFile;
use weft_core::typed::Task;

use crate::cli::{Cli, Commands, LogFormatArg};
use crate::demo::{Echo, EchoHandler, Flaky, FlakyHandler};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    observability::init(match cli.log_format {
        LogFormatArg::Text => LogFormat::Text,
        LogFormatArg::Json => LogFormat::Json,
    });

    let config = match &cli.config {
        Some(path) => WeftConfig::load(path)?,
        None => WeftConfig::default(),
    };
    // held until the snapshot is written back; a concurrent invocation
    // fails instead of overwriting tasks it never loaded
    let mut state_file = StateFile::open(&cli.state)?;
    let state = state_file
        .try_lock()
        .with_context(|| format!("lock state {}", cli.state.display()))?;
    let store = Arc::new(
        state
            .load(Arc::new(SystemClock))
            .await
            .with_context(|| format!("load state from {}", cli.state.display()))?,
    );
    let app = AppBuilder::new()
        .register::<Echo, _>(EchoHandler)?
        .register::<Flaky, _>(FlakyHandler)?
        .expect_tasks(&[Echo::TYPE, Flaky::TYPE])
        .with_config(config)
        .with_backend(store.clone())
        .build()?;

    let outcome = execute(&app, cli.command).await;

    state
        .save(&store)
        .await
        .with_context(|| format!("save state to {}", cli.state.display()))?;
    outcome?;
    Ok(())
}

async fn execute(app: &App, command: Commands) -> Result<()> {
    match command {
        Commands::Submit {
            task_type,
            payload,
            priority,
            max_retries,
            idempotency_key,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let mut request =
                NewTask::new(task_type, payload).with_priority(Priority::new(priority)?);
            request.max_retries = max_retries;
            request.idempotency_key = idempotency_key;
            let task_id = app.queue.submit(request).await?;
            println!("{task_id}");
        }

        Commands::Status { task_id } => {
            let task_id: TaskId = task_id.parse()?;
            match app.queue.get(task_id).await? {
                Some(view) => print_json(&view)?,
                None => bail!("task {task_id} not found"),
            }
        }

        Commands::Counts => print_json(&app.queue.counts().await?)?,

        Commands::Workers => print_json(&app.queue.workers().await?)?,

        Commands::DeadLetters {
            task_type,
            category,
            limit,
        } => {
            let mut filter = DeadLetterFilter::default().with_limit(limit);
            if let Some(task_type) = task_type {
                filter = filter.with_task_type(task_type);
            }
            if let Some(category) = category {
                filter = filter.with_category(parse_category(&category)?);
            }
            print_json(&app.queue.list_dead_letters(&filter).await?)?;
        }

        Commands::Replay { dead_letter_id } => {
            let id: DeadLetterId = dead_letter_id.parse()?;
            let task_id = app.queue.replay(id).await?;
            println!("{task_id}");
        }

        Commands::Reclaim => {
            let report = app.reaper().run_once().await?;
            println!(
                "reclaimed={} evicted={} promoted={}",
                report.reclaimed, report.evicted, report.promoted
            );
        }

        Commands::Run {
            workers,
            until_idle,
        } => run_workers(app, workers.max(1), until_idle).await?,
    }
    Ok(())
}

async fn run_workers(app: &App, workers: usize, until_idle: bool) -> Result<()> {
    let group = app.spawn_workers(workers);
    let (reaper_stop, reaper_signal) = shutdown_channel();
    let reaper = tokio::spawn(app.reaper().run(reaper_signal));
    info!(workers, "running, press Ctrl-C to stop");

    if until_idle {
        tokio::select! {
            r = tokio::signal::ctrl_c() => r.context("listen for Ctrl-C")?,
            r = wait_until_idle(app) => r?,
        }
    } else {
        tokio::signal::ctrl_c().await.context("listen for Ctrl-C")?;
    }

    info!("shutting down");
    let reports = group.shutdown_and_join().await;
    reaper_stop.shutdown();
    let _ = reaper.await;

    for report in reports {
        println!(
            "completed={} rescheduled={} dead_lettered={} released={} abandoned={} lost={}",
            report.completed,
            report.rescheduled,
            report.dead_lettered,
            report.released,
            report.abandoned,
            report.lost
        );
    }
    Ok(())
}

async fn wait_until_idle(app: &App) -> Result<()> {
    loop {
        if app.queue.counts().await?.active() == 0 {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn parse_category(s: &str) -> Result<ErrorCategory> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .with_context(|| format!("unknown error category '{s}'"))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
