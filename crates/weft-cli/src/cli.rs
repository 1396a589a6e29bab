//! Command line definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// weft - durable task queue CLI
#[derive(Parser, Debug)]
#[command(name = "weft", version, about = "Durable task execution with retries, breakers and dead letters")]
pub struct Cli {
    /// Snapshot file holding the queue state between invocations
    #[arg(long, global = true, env = "WEFT_STATE", default_value = "weft-state.json")]
    pub state: PathBuf,

    /// JSON config file (defaults apply to missing fields)
    #[arg(long, global = true, env = "WEFT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Text)]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a new task
    Submit {
        /// Task type (e.g. `demo.echo.v1`)
        #[arg(long, short = 't')]
        task_type: String,

        /// Payload as JSON
        #[arg(long, short = 'p', default_value = "{}")]
        payload: String,

        /// Priority 0-10, higher runs first
        #[arg(long, default_value_t = 5)]
        priority: u8,

        /// Retry budget (default: per type, then config)
        #[arg(long)]
        max_retries: Option<u32>,

        /// Submissions sharing a key create one task
        #[arg(long)]
        idempotency_key: Option<String>,
    },

    /// Show one task
    Status {
        /// Task ID (`task-<ULID>`)
        task_id: String,
    },

    /// Task and worker counts
    Counts,

    /// Registered workers
    Workers,

    /// List dead-lettered tasks, newest first
    DeadLetters {
        #[arg(long, short = 't')]
        task_type: Option<String>,

        /// transient, rate_limited, permanent, code_defect or unknown
        #[arg(long)]
        category: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Re-enqueue a dead-lettered task as a fresh task
    Replay {
        /// Dead-letter ID (`dlq-<ULID>`)
        dead_letter_id: String,
    },

    /// Run one liveness sweep: reclaim stuck tasks, evict dead workers, promote aged tasks
    Reclaim,

    /// Run workers with the demo handlers
    Run {
        #[arg(long, short = 'w', default_value_t = 1)]
        workers: usize,

        /// Stop once no task is pending or processing
        #[arg(long)]
        until_idle: bool,
    },
}
