//! Execution worker: one admitted firing, start to finish.
//!
//! A firing is up to `retry_count + 1` attempts run back to back while the
//! dispatcher slot stays held. Each attempt gets its own ledger row. Errors
//! stay inside the worker; callers only see the [`FiringReport`].

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use taskwarden_core::config::{EngineConfig, RunnerConfig};
use taskwarden_store::{exit_code, RunLedger, RunOutcome, RunTrigger, StoreError, Task, TaskStore};

use crate::command::CommandLine;
use crate::error::EngineError;
use crate::notify::NotificationSink;
use crate::spawner::{OutputLine, ProcessSpawner, SpawnedProcess};
use crate::truncate::LogBuffer;

/// Per-attempt knobs taken from `[engine]` and `[runner]`.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub runner: RunnerConfig,
    pub max_run: Option<Duration>,
    pub max_log_chars: usize,
    pub output_grace: Duration,
}

impl WorkerSettings {
    pub fn new(engine: &EngineConfig, runner: &RunnerConfig) -> Self {
        Self {
            runner: runner.clone(),
            max_run: engine.max_run_secs.map(Duration::from_secs),
            max_log_chars: engine.max_log_chars,
            output_grace: Duration::from_millis(engine.output_grace_ms),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::new(&EngineConfig::default(), &RunnerConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FiringStatus {
    Succeeded,
    /// All attempts failed.
    Failed,
    Cancelled,
    /// The task no longer exists, or was disabled before a scheduled
    /// firing started.
    Skipped,
    /// The ledger was unavailable; the firing was dropped.
    Abandoned,
}

impl FiringStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FiringStatus::Succeeded => "succeeded",
            FiringStatus::Failed => "failed",
            FiringStatus::Cancelled => "cancelled",
            FiringStatus::Skipped => "skipped",
            FiringStatus::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for FiringStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FiringStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(FiringStatus::Succeeded),
            "failed" => Ok(FiringStatus::Failed),
            "cancelled" => Ok(FiringStatus::Cancelled),
            "skipped" => Ok(FiringStatus::Skipped),
            "abandoned" => Ok(FiringStatus::Abandoned),
            other => Err(EngineError::Store(StoreError::Corrupt(format!(
                "unknown firing status: {other}"
            )))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptReport {
    pub run_id: i64,
    pub attempt: u32,
    pub exit_code: i32,
    pub outcome: RunOutcome,
    /// Set when the process never started.
    pub spawn_error: Option<SpawnFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpawnFailure {
    pub program: String,
    pub reason: String,
}

/// What happened to one firing.
#[derive(Debug, Clone, Serialize)]
pub struct FiringReport {
    pub task_id: String,
    pub trigger: RunTrigger,
    pub status: FiringStatus,
    pub attempts: Vec<AttemptReport>,
}

impl FiringReport {
    fn new(task_id: &str, trigger: RunTrigger, status: FiringStatus) -> Self {
        Self {
            task_id: task_id.to_string(),
            trigger,
            status,
            attempts: Vec::new(),
        }
    }

    pub fn last_exit_code(&self) -> Option<i32> {
        self.attempts.last().map(|a| a.exit_code)
    }

    /// The failure of the last attempt as an error, if the firing failed.
    pub fn error(&self) -> Option<EngineError> {
        if self.status != FiringStatus::Failed {
            return None;
        }
        let last = self.attempts.last()?;
        Some(match &last.spawn_error {
            Some(failure) => EngineError::Spawn {
                program: failure.program.clone(),
                reason: failure.reason.clone(),
            },
            None => EngineError::Runtime {
                code: last.exit_code,
            },
        })
    }
}

/// How an attempt ended before it is mapped to an outcome.
enum AttemptEnd {
    Exited(i32),
    SpawnFailed(SpawnFailure),
    Cancelled,
    TimedOut,
}

struct AttemptResult {
    end: AttemptEnd,
    log: LogBuffer,
}

impl AttemptResult {
    fn exit_code(&self) -> i32 {
        match self.end {
            AttemptEnd::Exited(code) => code,
            AttemptEnd::SpawnFailed(_) => exit_code::SPAWN_FAILED,
            AttemptEnd::Cancelled => exit_code::CANCELLED,
            AttemptEnd::TimedOut => exit_code::TIMED_OUT,
        }
    }
}

/// Runs firings. Cheap to share behind an `Arc`; holds no per-firing state.
pub struct Worker {
    tasks: TaskStore,
    ledger: RunLedger,
    spawner: Arc<dyn ProcessSpawner>,
    notifier: Arc<dyn NotificationSink>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        tasks: TaskStore,
        ledger: RunLedger,
        spawner: Arc<dyn ProcessSpawner>,
        notifier: Arc<dyn NotificationSink>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            tasks,
            ledger,
            spawner,
            notifier,
            settings,
        }
    }

    /// Execute one firing of `task_id` with retries until success, attempts
    /// run out, or `cancel` fires.
    #[instrument(skip(self, cancel))]
    pub async fn run_firing(
        &self,
        task_id: &str,
        trigger: RunTrigger,
        cancel: &CancellationToken,
    ) -> FiringReport {
        let task = match self.tasks.find_task(task_id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id, "task no longer exists, skipping firing");
                return FiringReport::new(task_id, trigger, FiringStatus::Skipped);
            }
            Err(e) => {
                error!(task_id, error = %e, "cannot load task, abandoning firing");
                return FiringReport::new(task_id, trigger, FiringStatus::Abandoned);
            }
        };
        if trigger == RunTrigger::Scheduled && !task.enabled {
            info!(task_id, "task disabled since it was queued, skipping firing");
            return FiringReport::new(task_id, trigger, FiringStatus::Skipped);
        }

        let max_attempts = task.max_attempts();
        let mut report = FiringReport::new(task_id, trigger, FiringStatus::Failed);
        for attempt in 1..=max_attempts {
            let run_id = match self.ledger.create_run(&task.id, attempt, trigger) {
                Ok(id) => id,
                Err(StoreError::TaskNotFound { .. }) => {
                    warn!(task_id, attempt, "task deleted mid-firing, stopping");
                    report.status = FiringStatus::Skipped;
                    return report;
                }
                Err(e) => {
                    error!(task_id, attempt, error = %e, "cannot record run, abandoning firing");
                    report.status = FiringStatus::Abandoned;
                    return report;
                }
            };
            info!(task_id, run_id, attempt, max_attempts, "attempt started");

            let result = self.run_attempt(&task, run_id, cancel).await;
            let code = result.exit_code();
            let outcome = match result.end {
                AttemptEnd::Cancelled => RunOutcome::Cancelled,
                _ if code == 0 => RunOutcome::Succeeded,
                _ if attempt < max_attempts => RunOutcome::FailedRetrying,
                _ => RunOutcome::FailedTerminal,
            };
            let log = result.log.finish();
            self.finalize(run_id, code, &log, outcome);
            info!(task_id, run_id, attempt, exit_code = code, %outcome, "attempt finished");

            report.attempts.push(AttemptReport {
                run_id,
                attempt,
                exit_code: code,
                outcome,
                spawn_error: match result.end {
                    AttemptEnd::SpawnFailed(failure) => Some(failure),
                    _ => None,
                },
            });

            match outcome {
                RunOutcome::Succeeded => {
                    report.status = FiringStatus::Succeeded;
                    if task.notify_on_success {
                        self.notify(&format!("Success: {}", task.name), "Run completed.")
                            .await;
                    }
                    return report;
                }
                RunOutcome::Cancelled => {
                    report.status = FiringStatus::Cancelled;
                    return report;
                }
                RunOutcome::FailedRetrying => {
                    let delay = Duration::from_secs(u64::from(task.retry_delay_minutes) * 60);
                    debug!(task_id, delay_secs = delay.as_secs(), "waiting before retry");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!(task_id, "stopped during retry delay");
                            report.status = FiringStatus::Cancelled;
                            return report;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RunOutcome::FailedTerminal | RunOutcome::Abandoned => break,
            }
        }

        report.status = FiringStatus::Failed;
        if task.notify_on_failure {
            self.notify(
                &format!("Failed: {}", task.name),
                &format!("Failed after {max_attempts} attempts."),
            )
            .await;
        }
        report
    }

    async fn run_attempt(
        &self,
        task: &Task,
        run_id: i64,
        cancel: &CancellationToken,
    ) -> AttemptResult {
        let spawned = CommandLine::resolve(&task.script_path, &self.settings.runner)
            .and_then(|command| self.spawner.spawn(&command));
        match spawned {
            Ok(process) => self.supervise(process, run_id, cancel).await,
            Err(e) => {
                warn!(task_id = %task.id, run_id, error = %e, "spawn failed");
                let failure = match e {
                    EngineError::Spawn { ref program, ref reason } => SpawnFailure {
                        program: program.clone(),
                        reason: reason.clone(),
                    },
                    ref other => SpawnFailure {
                        program: task.script_path.clone(),
                        reason: other.to_string(),
                    },
                };
                let mut log = LogBuffer::new(self.settings.max_log_chars);
                log.push_str(&format!("{e}\n"));
                AttemptResult {
                    log,
                    end: AttemptEnd::SpawnFailed(failure),
                }
            }
        }
    }

    /// Stream output while waiting for exit, a stop request or the deadline.
    async fn supervise(
        &self,
        process: SpawnedProcess,
        run_id: i64,
        cancel: &CancellationToken,
    ) -> AttemptResult {
        let SpawnedProcess {
            pid,
            mut output,
            mut handle,
        } = process;
        debug!(run_id, pid, "supervising process");

        let max_run = self.settings.max_run;
        let deadline = async move {
            match max_run {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut log = LogBuffer::new(self.settings.max_log_chars);
        let mut output_open = true;
        let end = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break AttemptEnd::Cancelled,
                _ = &mut deadline => break AttemptEnd::TimedOut,
                line = output.recv(), if output_open => match line {
                    Some(line) => push_line(&mut log, run_id, line),
                    None => output_open = false,
                },
                status = handle.wait() => match status {
                    Ok(code) => break AttemptEnd::Exited(code),
                    Err(e) => {
                        log.push_str(&format!("[taskwarden] wait failed: {e}\n"));
                        break AttemptEnd::Exited(exit_code::SIGNALLED);
                    }
                },
            }
        };

        if matches!(end, AttemptEnd::Cancelled | AttemptEnd::TimedOut) {
            if let Err(e) = handle.kill().await {
                warn!(run_id, error = %e, "kill failed");
            }
            let _ = tokio::time::timeout(self.settings.output_grace, handle.wait()).await;
            if matches!(end, AttemptEnd::TimedOut) {
                log.push_str("[taskwarden] killed: maximum run time exceeded\n");
            }
        }
        if output_open {
            self.drain(&mut output, &mut log, run_id).await;
        }
        AttemptResult { end, log }
    }

    /// Collect what is left in the pipes, giving up after the grace period
    /// (a detached descendant may keep them open indefinitely).
    async fn drain(
        &self,
        output: &mut mpsc::Receiver<OutputLine>,
        log: &mut LogBuffer,
        run_id: i64,
    ) {
        let drained = tokio::time::timeout(self.settings.output_grace, async {
            while let Some(line) = output.recv().await {
                push_line(log, run_id, line);
            }
        })
        .await;
        if drained.is_err() {
            debug!(run_id, "output still open after grace period, detaching");
        }
    }

    /// Finalize with one retry; the ledger makes repeats harmless.
    fn finalize(&self, run_id: i64, code: i32, log: &str, outcome: RunOutcome) {
        for _ in 0..2 {
            match self.ledger.finalize_run(run_id, code, log, outcome) {
                Ok(_) => return,
                Err(StoreError::RunNotFound { .. }) => {
                    warn!(run_id, "run row vanished before finalize (task deleted?)");
                    return;
                }
                Err(e) => error!(run_id, error = %e, "finalize failed"),
            }
        }
    }

    async fn notify(&self, title: &str, message: &str) {
        if let Err(e) = self.notifier.notify(title, message).await {
            warn!(%title, error = %e, "notification failed");
        }
    }
}

fn push_line(log: &mut LogBuffer, run_id: i64, line: OutputLine) {
    trace!(run_id, stream = ?line.stream, text = %line.text.trim_end(), "output");
    log.push_str(&line.text);
}
