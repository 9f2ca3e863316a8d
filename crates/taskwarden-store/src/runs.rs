use chrono::{DateTime, Duration, Local, SecondsFormat, Timelike, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info, instrument, warn};

use crate::db::{lock, now_timestamp, SharedConnection};
use crate::error::{Result, StoreError};
use crate::types::{
    exit_code, AggregateStats, OutcomeCounts, RunOutcome, RunRecord, RunTrigger, TaskDuration,
};

const RUN_COLUMNS: &str = "id, task_id, attempt, trigger, start_time, end_time,
     duration_seconds, exit_code, outcome, log_output";

/// Append-mostly record of every attempt.
///
/// Rows are created when an attempt starts and finalized exactly once when
/// it ends; after that they never change.
#[derive(Clone)]
pub struct RunLedger {
    conn: SharedConnection,
}

impl RunLedger {
    pub(crate) fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Open a run row with `start_time = now` and return its id.
    #[instrument(skip(self))]
    pub fn create_run(&self, task_id: &str, attempt: u32, trigger: RunTrigger) -> Result<i64> {
        self.insert_run(task_id, attempt, trigger, &now_timestamp())
    }

    fn insert_run(
        &self,
        task_id: &str,
        attempt: u32,
        trigger: RunTrigger,
        start_time: &str,
    ) -> Result<i64> {
        let db = lock(&self.conn)?;
        let exists: bool = db
            .query_row("SELECT 1 FROM tasks WHERE id = ?1", [task_id], |_| Ok(true))
            .optional()?
            .unwrap_or(false);
        if !exists {
            return Err(StoreError::TaskNotFound {
                id: task_id.to_string(),
            });
        }
        db.execute(
            "INSERT INTO runs (task_id, attempt, trigger, start_time)
             VALUES (?1, ?2, ?3, ?4)",
            params![task_id, attempt, trigger.as_str(), start_time],
        )?;
        let run_id = db.last_insert_rowid();
        debug!(task_id, run_id, attempt, "run opened");
        Ok(run_id)
    }

    /// Close a run. Returns `false` (and changes nothing) if it was already
    /// finalized.
    #[instrument(skip(self, log_output), fields(log_len = log_output.len()))]
    pub fn finalize_run(
        &self,
        run_id: i64,
        exit_code: i32,
        log_output: &str,
        outcome: RunOutcome,
    ) -> Result<bool> {
        let db = lock(&self.conn)?;
        let row: Option<(String, Option<String>)> = db
            .query_row(
                "SELECT start_time, end_time FROM runs WHERE id = ?1",
                [run_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((start_time, end_time)) = row else {
            return Err(StoreError::RunNotFound { id: run_id });
        };
        if end_time.is_some() {
            debug!(run_id, "run already finalized");
            return Ok(false);
        }

        let now = Utc::now();
        let duration = parse_timestamp(&start_time)
            .map(|start| (now - start).num_milliseconds().max(0) as f64 / 1000.0);
        let n = db.execute(
            "UPDATE runs
             SET end_time = ?2, duration_seconds = ?3, exit_code = ?4,
                 outcome = ?5, log_output = ?6
             WHERE id = ?1 AND end_time IS NULL",
            params![
                run_id,
                now.to_rfc3339_opts(SecondsFormat::Millis, true),
                duration,
                exit_code,
                outcome.as_str(),
                log_output,
            ],
        )?;
        Ok(n == 1)
    }

    /// Most recent runs of a task first.
    pub fn list_runs_for_task(&self, task_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let db = lock(&self.conn)?;
        let mut stmt = db.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE task_id = ?1
             ORDER BY start_time DESC, id DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![task_id, limit as i64], row_to_raw_run)?;
        let mut runs = Vec::new();
        for raw in rows {
            runs.push(raw?.into_record()?);
        }
        Ok(runs)
    }

    pub fn get_run(&self, run_id: i64) -> Result<RunRecord> {
        let db = lock(&self.conn)?;
        db.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
            [run_id],
            row_to_raw_run,
        )
        .optional()?
        .ok_or(StoreError::RunNotFound { id: run_id })?
        .into_record()
    }

    /// Captured output of a run; `None` while it is still in flight.
    pub fn get_log(&self, run_id: i64) -> Result<Option<String>> {
        let db = lock(&self.conn)?;
        db.query_row(
            "SELECT log_output FROM runs WHERE id = ?1",
            [run_id],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?
        .ok_or(StoreError::RunNotFound { id: run_id })
    }

    /// Success / failure counts of attempts started in the last
    /// `window_hours`, with a per-exit-code breakdown.
    pub fn outcome_counts(&self, window_hours: u32) -> Result<OutcomeCounts> {
        let cutoff = window_start(window_hours);
        let db = lock(&self.conn)?;
        let mut stmt = db.prepare(
            "SELECT exit_code, COUNT(*) FROM runs
             WHERE start_time >= ?1 AND exit_code IS NOT NULL
             GROUP BY exit_code",
        )?;
        let rows = stmt.query_map([cutoff], |row| {
            Ok((row.get::<_, i32>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = OutcomeCounts::default();
        for row in rows {
            let (code, n) = row?;
            let n = n as u64;
            if code == 0 {
                counts.succeeded += n;
            } else {
                counts.failed += n;
            }
            counts.by_exit_code.insert(code, n);
        }
        Ok(counts)
    }

    /// Attempts started per local hour of day over the last `window_hours`.
    pub fn hourly_activity(&self, window_hours: u32) -> Result<[u64; 24]> {
        let cutoff = window_start(window_hours);
        let db = lock(&self.conn)?;
        let mut stmt = db.prepare("SELECT start_time FROM runs WHERE start_time >= ?1")?;
        let rows = stmt.query_map([cutoff], |row| row.get::<_, String>(0))?;

        let mut buckets = [0u64; 24];
        for start in rows {
            let start = start?;
            match parse_timestamp(&start) {
                Some(ts) => buckets[ts.with_timezone(&Local).hour() as usize] += 1,
                None => warn!(start_time = %start, "skipping run with unparseable start time"),
            }
        }
        Ok(buckets)
    }

    /// Tasks with the longest average attempt duration, slowest first.
    pub fn top_tasks_by_avg_duration(&self, limit: usize) -> Result<Vec<TaskDuration>> {
        let db = lock(&self.conn)?;
        let mut stmt = db.prepare(
            "SELECT r.task_id, t.name, AVG(r.duration_seconds), COUNT(*)
             FROM runs r JOIN tasks t ON t.id = r.task_id
             WHERE r.duration_seconds IS NOT NULL
             GROUP BY r.task_id
             ORDER BY AVG(r.duration_seconds) DESC, t.name
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(TaskDuration {
                task_id: row.get(0)?,
                name: row.get(1)?,
                avg_duration_secs: row.get(2)?,
                runs: row.get::<_, i64>(3)? as u64,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// The three stats queries in one bundle.
    pub fn aggregate_stats(&self, window_hours: u32, top: usize) -> Result<AggregateStats> {
        Ok(AggregateStats {
            window_hours,
            counts: self.outcome_counts(window_hours)?,
            hourly: self.hourly_activity(window_hours)?,
            slowest: self.top_tasks_by_avg_duration(top)?,
        })
    }

    /// Finalize every run a previous process left open as abandoned.
    /// Returns how many rows were closed.
    pub fn abandon_unfinished(&self) -> Result<usize> {
        let db = lock(&self.conn)?;
        let n = db.execute(
            "UPDATE runs
             SET end_time = ?1, exit_code = ?2, outcome = ?3,
                 log_output = COALESCE(log_output, '')
             WHERE end_time IS NULL",
            params![
                now_timestamp(),
                exit_code::ABANDONED,
                RunOutcome::Abandoned.as_str()
            ],
        )?;
        if n > 0 {
            info!(count = n, "abandoned runs left open by a previous process");
        }
        Ok(n)
    }
}

fn window_start(window_hours: u32) -> String {
    (Utc::now() - Duration::hours(i64::from(window_hours)))
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

struct RawRun {
    record: RunRecord,
    trigger: String,
    outcome: Option<String>,
}

impl RawRun {
    fn into_record(self) -> Result<RunRecord> {
        let mut record = self.record;
        record.trigger = self.trigger.parse()?;
        record.outcome = self.outcome.as_deref().map(str::parse).transpose()?;
        Ok(record)
    }
}

fn row_to_raw_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        trigger: row.get(3)?,
        outcome: row.get(8)?,
        record: RunRecord {
            id: row.get(0)?,
            task_id: row.get(1)?,
            attempt: row.get::<_, i64>(2)?.max(1) as u32,
            trigger: RunTrigger::Scheduled,
            start_time: row.get(4)?,
            end_time: row.get(5)?,
            duration_seconds: row.get(6)?,
            exit_code: row.get(7)?,
            outcome: None,
            log_output: row.get(9)?,
        },
    })
}
