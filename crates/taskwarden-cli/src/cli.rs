//! Command-line arguments.

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "taskwarden",
    version,
    about = "Run scripts on a weekly schedule with bounded concurrency.",
    long_about = None
)]
pub struct Cli {
    /// Path to the config file (TOML). Falls back to `TASKWARDEN_CONFIG`, then
    /// `~/.taskwarden/taskwarden.toml`.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<String>,

    /// Print machine-readable JSON instead of tables.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the scheduler until Ctrl-C.
    Serve,
    /// Manage task definitions.
    #[command(subcommand)]
    Task(TaskCommand),
    /// Fire a task once and wait for it to finish. When another process is
    /// serving the database the run goes through its queue.
    Run {
        id: String,
    },
    /// Stop a pending or running firing in the serving process.
    Stop {
        id: String,
    },
    /// Recent runs of a task, newest first.
    History {
        id: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Captured output of one run.
    Log {
        run_id: i64,
    },
    /// Outcome counts, hourly activity and slowest tasks.
    Stats {
        #[arg(long, default_value_t = 24)]
        hours: u32,
        #[arg(long, default_value_t = 5)]
        top: usize,
    },
    /// Show or set the number of tasks allowed to run at once (1-10).
    Concurrency {
        value: Option<i64>,
    },
}

#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    List,
    Show {
        id: String,
    },
    Add(AddArgs),
    Update(UpdateArgs),
    Remove {
        id: String,
    },
    /// Flip the enabled flag.
    Toggle {
        id: String,
    },
}

#[derive(Debug, Args)]
pub struct AddArgs {
    pub name: String,
    /// Executable or script to run.
    pub script: String,
    /// Use this id instead of a generated one.
    #[arg(long)]
    pub id: Option<String>,
    /// Schedule entry `DAY=HH:MM[,HH:MM...]`, repeatable.
    #[arg(long = "at", value_name = "DAY=TIMES")]
    pub at: Vec<String>,
    /// Extra attempts after a failure.
    #[arg(long, default_value_t = 0)]
    pub retries: u32,
    #[arg(long, value_name = "MINUTES", default_value_t = 5)]
    pub retry_delay: u32,
    #[arg(long)]
    pub notify_success: bool,
    #[arg(long)]
    pub no_notify_failure: bool,
    /// Create the task disabled.
    #[arg(long)]
    pub disabled: bool,
}

#[derive(Debug, Args)]
pub struct UpdateArgs {
    pub id: String,
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long)]
    pub script: Option<String>,
    /// Replace the schedule with these entries.
    #[arg(long = "at", value_name = "DAY=TIMES", conflicts_with = "clear_schedule")]
    pub at: Vec<String>,
    /// Remove every schedule entry.
    #[arg(long)]
    pub clear_schedule: bool,
    #[arg(long)]
    pub retries: Option<u32>,
    #[arg(long, value_name = "MINUTES")]
    pub retry_delay: Option<u32>,
    #[arg(long, value_name = "BOOL")]
    pub notify_success: Option<bool>,
    #[arg(long, value_name = "BOOL")]
    pub notify_failure: Option<bool>,
    #[arg(long, value_name = "BOOL")]
    pub enabled: Option<bool>,
}
