use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::schedule::WeeklySchedule;

/// Exit codes recorded when the process produced no real exit status.
pub mod exit_code {
    /// The process could not be started.
    pub const SPAWN_FAILED: i32 = -1;
    /// Killed by a stop request.
    pub const CANCELLED: i32 = -2;
    /// Killed by the max-duration guard.
    pub const TIMED_OUT: i32 = -3;
    /// Terminated by a signal, no exit status available.
    pub const SIGNALLED: i32 = -4;
    /// The engine stopped while the attempt was in flight.
    pub const ABANDONED: i32 = -5;
}

pub const DEFAULT_RETRY_DELAY_MINUTES: u32 = 5;

/// A persisted task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable unique id (UUID v4 unless supplied at creation).
    pub id: String,
    pub name: String,
    /// Executable path or command.
    pub script_path: String,
    pub schedule: WeeklySchedule,
    pub enabled: bool,
    /// Extra attempts after the first failure.
    pub retry_count: u32,
    pub retry_delay_minutes: u32,
    pub notify_on_success: bool,
    pub notify_on_failure: bool,
    /// RFC3339 timestamp of creation.
    pub created_at: String,
    /// RFC3339 timestamp of the last modification.
    pub updated_at: String,
}

impl Task {
    /// Maximum number of attempts for one firing.
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }
}

/// Input for [`crate::TaskStore::create_task`]. Omitted fields take the
/// documented defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub script_path: String,
    #[serde(default)]
    pub schedule: WeeklySchedule,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_minutes: u32,
    #[serde(default)]
    pub notify_on_success: bool,
    #[serde(default = "default_true")]
    pub notify_on_failure: bool,
}

impl NewTask {
    pub fn new(name: impl Into<String>, script_path: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            script_path: script_path.into(),
            schedule: WeeklySchedule::new(),
            enabled: true,
            retry_count: 0,
            retry_delay_minutes: DEFAULT_RETRY_DELAY_MINUTES,
            notify_on_success: false,
            notify_on_failure: true,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_schedule(mut self, schedule: WeeklySchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_retries(mut self, retry_count: u32, retry_delay_minutes: u32) -> Self {
        self.retry_count = retry_count;
        self.retry_delay_minutes = retry_delay_minutes;
        self
    }
}

fn default_true() -> bool {
    true
}

fn default_retry_delay() -> u32 {
    DEFAULT_RETRY_DELAY_MINUTES
}

/// Partial update; `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub script_path: Option<String>,
    pub schedule: Option<WeeklySchedule>,
    pub enabled: Option<bool>,
    pub retry_count: Option<u32>,
    pub retry_delay_minutes: Option<u32>,
    pub notify_on_success: Option<bool>,
    pub notify_on_failure: Option<bool>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.script_path.is_none()
            && self.schedule.is_none()
            && self.enabled.is_none()
            && self.retry_count.is_none()
            && self.retry_delay_minutes.is_none()
            && self.notify_on_success.is_none()
            && self.notify_on_failure.is_none()
    }

    pub(crate) fn apply(self, task: &mut Task) {
        if let Some(v) = self.name {
            task.name = v;
        }
        if let Some(v) = self.script_path {
            task.script_path = v;
        }
        if let Some(mut v) = self.schedule {
            v.normalize();
            task.schedule = v;
        }
        if let Some(v) = self.enabled {
            task.enabled = v;
        }
        if let Some(v) = self.retry_count {
            task.retry_count = v;
        }
        if let Some(v) = self.retry_delay_minutes {
            task.retry_delay_minutes = v;
        }
        if let Some(v) = self.notify_on_success {
            task.notify_on_success = v;
        }
        if let Some(v) = self.notify_on_failure {
            task.notify_on_failure = v;
        }
    }
}

/// Check the invariants every stored task must satisfy.
pub(crate) fn validate_task(task: &Task) -> Result<()> {
    if task.id.trim().is_empty() {
        return Err(StoreError::Configuration("task id must not be empty".into()));
    }
    if task.name.trim().is_empty() {
        return Err(StoreError::Configuration("task name must not be empty".into()));
    }
    if task.script_path.trim().is_empty() {
        return Err(StoreError::Configuration(
            "task script path must not be empty".into(),
        ));
    }
    if task.enabled && task.schedule.is_empty() {
        return Err(StoreError::Configuration(format!(
            "task '{}' is enabled but has no scheduled times",
            task.name
        )));
    }
    Ok(())
}

/// What caused a firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

impl RunTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Manual => "manual",
        }
    }
}

impl std::fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunTrigger {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(RunTrigger::Scheduled),
            "manual" => Ok(RunTrigger::Manual),
            other => Err(StoreError::Corrupt(format!("unknown run trigger: {other}"))),
        }
    }
}

/// Final state of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    /// Failed, another attempt follows.
    FailedRetrying,
    /// Failed with no attempts left.
    FailedTerminal,
    /// Stopped on request.
    Cancelled,
    /// Left unfinished by a previous engine process.
    Abandoned,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::FailedRetrying => "failed_retrying",
            RunOutcome::FailedTerminal => "failed_terminal",
            RunOutcome::Cancelled => "cancelled",
            RunOutcome::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunOutcome {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "succeeded" => Ok(RunOutcome::Succeeded),
            "failed_retrying" => Ok(RunOutcome::FailedRetrying),
            "failed_terminal" => Ok(RunOutcome::FailedTerminal),
            "cancelled" => Ok(RunOutcome::Cancelled),
            "abandoned" => Ok(RunOutcome::Abandoned),
            other => Err(StoreError::Corrupt(format!("unknown run outcome: {other}"))),
        }
    }
}

/// One attempt of one firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub task_id: String,
    /// 1-based attempt number within the firing.
    pub attempt: u32,
    pub trigger: RunTrigger,
    pub start_time: String,
    pub end_time: Option<String>,
    pub duration_seconds: Option<f64>,
    pub exit_code: Option<i32>,
    pub outcome: Option<RunOutcome>,
    pub log_output: Option<String>,
}

impl RunRecord {
    pub fn is_finalized(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Bounded concurrency limit, 1..=10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct ConcurrencyLimit(usize);

impl ConcurrencyLimit {
    pub const MIN: usize = 1;
    pub const MAX: usize = 10;
    pub const DEFAULT: ConcurrencyLimit = ConcurrencyLimit(3);

    pub fn new(value: i64) -> Result<Self> {
        if value < Self::MIN as i64 || value > Self::MAX as i64 {
            return Err(StoreError::ConcurrencyLimit {
                value,
                min: Self::MIN,
                max: Self::MAX,
            });
        }
        Ok(Self(value as usize))
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl Default for ConcurrencyLimit {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<i64> for ConcurrencyLimit {
    type Error = StoreError;

    fn try_from(value: i64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ConcurrencyLimit> for i64 {
    fn from(limit: ConcurrencyLimit) -> i64 {
        limit.0 as i64
    }
}

impl std::fmt::Display for ConcurrencyLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Finalized attempts in a trailing window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    /// Attempts with exit code 0.
    pub succeeded: u64,
    /// Attempts with any other exit code.
    pub failed: u64,
    pub by_exit_code: BTreeMap<i32, u64>,
}

/// Average attempt duration of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDuration {
    pub task_id: String,
    pub name: String,
    pub avg_duration_secs: f64,
    pub runs: u64,
}

/// Everything the stats view shows, gathered in one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub window_hours: u32,
    pub counts: OutcomeCounts,
    /// Attempts started per local hour of day, index 0..24.
    pub hourly: [u64; 24],
    pub slowest: Vec<TaskDuration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_defaults() {
        let spec: NewTask =
            serde_json::from_str(r#"{"name":"backup","script_path":"/opt/backup.sh"}"#).unwrap();
        assert!(spec.enabled);
        assert_eq!(spec.retry_count, 0);
        assert_eq!(spec.retry_delay_minutes, 5);
        assert!(!spec.notify_on_success);
        assert!(spec.notify_on_failure);
    }

    #[test]
    fn outcome_text_round_trips() {
        for outcome in [
            RunOutcome::Succeeded,
            RunOutcome::FailedRetrying,
            RunOutcome::FailedTerminal,
            RunOutcome::Cancelled,
            RunOutcome::Abandoned,
        ] {
            assert_eq!(outcome.as_str().parse::<RunOutcome>().unwrap(), outcome);
        }
        assert!("exploded".parse::<RunOutcome>().is_err());
    }

    #[test]
    fn concurrency_limit_bounds() {
        assert!(ConcurrencyLimit::new(0).is_err());
        assert!(ConcurrencyLimit::new(11).is_err());
        assert_eq!(ConcurrencyLimit::new(10).unwrap().get(), 10);
        assert_eq!(ConcurrencyLimit::default().get(), 3);
    }

    #[test]
    fn patch_normalizes_schedule() {
        let mut task = Task {
            id: "t".into(),
            name: "t".into(),
            script_path: "/bin/true".into(),
            schedule: WeeklySchedule::new(),
            enabled: false,
            retry_count: 0,
            retry_delay_minutes: 5,
            notify_on_success: false,
            notify_on_failure: true,
            created_at: String::new(),
            updated_at: String::new(),
        };
        let patch = TaskPatch {
            schedule: Some(WeeklySchedule::from_json(r#"{"1":["10:00"]}"#).unwrap()),
            enabled: Some(true),
            ..TaskPatch::default()
        };
        patch.apply(&mut task);
        assert!(task.enabled);
        assert!(validate_task(&task).is_ok());
    }

    #[test]
    fn enabled_task_needs_schedule() {
        let task = Task {
            id: "t".into(),
            name: "nightly".into(),
            script_path: "/bin/true".into(),
            schedule: WeeklySchedule::new(),
            enabled: true,
            retry_count: 0,
            retry_delay_minutes: 5,
            notify_on_success: false,
            notify_on_failure: true,
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert!(matches!(
            validate_task(&task),
            Err(StoreError::Configuration(_))
        ));
    }
}
