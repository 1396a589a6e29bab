//! Demo task types run by `weft run`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use weft_core::domain::TaskFailure;
use weft_core::typed::{Handler, Task, TaskContext, TaskOutput};

#[derive(Debug, Serialize, Deserialize)]
pub struct Echo {
    pub message: String,
}

impl Task for Echo {
    const TYPE: &'static str = "demo.echo.v1";
}

pub struct EchoHandler;

#[async_trait]
impl Handler<Echo> for EchoHandler {
    async fn handle(&self, task: Echo, _ctx: &TaskContext) -> Result<TaskOutput, TaskFailure> {
        println!("{}", task.message);
        Ok(TaskOutput::with_summary(task.message))
    }
}

/// Fails with a connection error on the first `fail_times` attempts.
#[derive(Debug, Serialize, Deserialize)]
pub struct Flaky {
    #[serde(default)]
    pub fail_times: u32,
}

impl Task for Flaky {
    const TYPE: &'static str = "demo.flaky.v1";
    const MAX_RETRIES: Option<u32> = Some(5);
}

pub struct FlakyHandler;

#[async_trait]
impl Handler<Flaky> for FlakyHandler {
    async fn handle(&self, task: Flaky, ctx: &TaskContext) -> Result<TaskOutput, TaskFailure> {
        ctx.report_progress(50, Some("calling upstream".into())).await;
        if ctx.retry_count < task.fail_times {
            return Err(TaskFailure::connection(format!(
                "upstream refused connection (attempt {})",
                ctx.retry_count + 1
            )));
        }
        Ok(TaskOutput::with_summary(format!(
            "succeeded after {} retries",
            ctx.retry_count
        )))
    }

    fn dependency(&self) -> Option<&str> {
        Some("flaky-upstream")
    }
}
