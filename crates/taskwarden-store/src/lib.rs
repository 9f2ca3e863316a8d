//! `taskwarden-store`: SQLite persistence for task definitions, run
//! attempts and engine settings.
//!
//! # Tables
//!
//! | Table      | Owner            | Notes                                        |
//! |------------|------------------|----------------------------------------------|
//! | `tasks`    | [`TaskStore`]    | one row per task, schedule stored as JSON    |
//! | `runs`     | [`RunLedger`]    | one row per attempt, `ON DELETE CASCADE`     |
//! | `settings` | [`SettingsStore`]| key/value, holds `max_concurrent_runs`       |
//! | `run_requests` | [`RequestQueue`] | run/stop requests handed to the serving process |
//! | `engine_lease` | [`EngineLease`]  | which process owns scheduling and admission |
//!
//! All tables share one connection (see [`Database`]) so foreign keys and the
//! cascade behave the same for in-memory and on-disk databases.

pub mod db;
pub mod error;
pub mod lease;
pub mod requests;
pub mod runs;
pub mod schedule;
pub mod settings;
pub mod tasks;
pub mod types;

pub use db::Database;
pub use error::{Result, StoreError};
pub use lease::{EngineLease, LeaseHolder};
pub use requests::{RequestKind, RequestQueue, RequestState, RunRequest};
pub use runs::RunLedger;
pub use schedule::{DayOfWeek, TimeOfDay, WeeklySchedule};
pub use settings::SettingsStore;
pub use tasks::TaskStore;
pub use types::{
    exit_code, AggregateStats, ConcurrencyLimit, NewTask, OutcomeCounts, RunOutcome, RunRecord,
    RunTrigger, Task, TaskDuration, TaskPatch,
};
