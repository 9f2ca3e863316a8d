use rusqlite::{params, OptionalExtension};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::db::{lock, now_timestamp, SharedConnection};
use crate::error::{Result, StoreError};
use crate::schedule::WeeklySchedule;
use crate::types::{validate_task, NewTask, Task, TaskPatch};

const TASK_COLUMNS: &str = "id, name, script_path, schedule_json, enabled, retry_count,
     retry_delay, notify_on_success, notify_on_failure, created_at, updated_at";

/// CRUD over the `tasks` table.
///
/// The store never notifies anyone about changes; callers that keep derived
/// state (the trigger index) refresh it after each mutating call.
#[derive(Clone)]
pub struct TaskStore {
    conn: SharedConnection,
}

impl TaskStore {
    pub(crate) fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Validate and insert a new task. A supplied id must be unused.
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub fn create_task(&self, spec: NewTask) -> Result<Task> {
        let id = match spec.id {
            Some(id) => id.trim().to_string(),
            None => Uuid::new_v4().to_string(),
        };
        let mut schedule = spec.schedule;
        schedule.normalize();
        let now = now_timestamp();
        let task = Task {
            id,
            name: spec.name.trim().to_string(),
            script_path: spec.script_path.trim().to_string(),
            schedule,
            enabled: spec.enabled,
            retry_count: spec.retry_count,
            retry_delay_minutes: spec.retry_delay_minutes,
            notify_on_success: spec.notify_on_success,
            notify_on_failure: spec.notify_on_failure,
            created_at: now.clone(),
            updated_at: now,
        };
        validate_task(&task)?;
        let schedule_json = task.schedule.to_json()?;

        let db = lock(&self.conn)?;
        let inserted = db.execute(
            "INSERT OR IGNORE INTO tasks
             (id, name, script_path, schedule_json, enabled, retry_count, retry_delay,
              notify_on_success, notify_on_failure, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                task.id,
                task.name,
                task.script_path,
                schedule_json,
                task.enabled,
                task.retry_count,
                task.retry_delay_minutes,
                task.notify_on_success,
                task.notify_on_failure,
                task.created_at,
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Configuration(format!(
                "a task with id '{}' already exists",
                task.id
            )));
        }
        info!(task_id = %task.id, "task created");
        Ok(task)
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.find_task(id)?
            .ok_or_else(|| StoreError::TaskNotFound { id: id.to_string() })
    }

    /// Like [`get_task`](Self::get_task) but `None` for an unknown id.
    pub fn find_task(&self, id: &str) -> Result<Option<Task>> {
        let db = lock(&self.conn)?;
        let raw = db
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                [id],
                row_to_raw_task,
            )
            .optional()?;
        raw.map(RawTask::into_task).transpose()
    }

    /// All tasks ordered by name.
    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let db = lock(&self.conn)?;
        let mut stmt = db.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY name COLLATE NOCASE, id"
        ))?;
        let rows = stmt.query_map([], row_to_raw_task)?;
        let mut tasks = Vec::new();
        for raw in rows {
            tasks.push(raw?.into_task()?);
        }
        Ok(tasks)
    }

    /// SQLite's `data_version` for this connection. It changes whenever
    /// another connection commits to the database, so a long-running reader
    /// can notice edits made by other processes. Commits on this connection
    /// leave it unchanged.
    pub fn data_version(&self) -> Result<i64> {
        let db = lock(&self.conn)?;
        Ok(db.query_row("PRAGMA data_version", [], |row| row.get(0))?)
    }

    /// Merge `patch` into the stored task, validate the result and save it.
    #[instrument(skip(self, patch))]
    pub fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        let mut task = self.get_task(id)?;
        patch.apply(&mut task);
        task.updated_at = now_timestamp();
        validate_task(&task)?;
        self.save(&task)?;
        info!(task_id = %id, "task updated");
        Ok(task)
    }

    /// Enable or disable a task. Enabling requires a non-empty schedule.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<Task> {
        self.update_task(
            id,
            TaskPatch {
                enabled: Some(enabled),
                ..TaskPatch::default()
            },
        )
    }

    /// Delete a task; its runs go with it (`ON DELETE CASCADE`).
    #[instrument(skip(self))]
    pub fn delete_task(&self, id: &str) -> Result<()> {
        let db = lock(&self.conn)?;
        let n = db.execute("DELETE FROM tasks WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(StoreError::TaskNotFound { id: id.to_string() });
        }
        info!(task_id = %id, "task deleted");
        Ok(())
    }

    fn save(&self, task: &Task) -> Result<()> {
        let schedule_json = task.schedule.to_json()?;
        let db = lock(&self.conn)?;
        let n = db.execute(
            "UPDATE tasks
             SET name = ?2, script_path = ?3, schedule_json = ?4, enabled = ?5,
                 retry_count = ?6, retry_delay = ?7, notify_on_success = ?8,
                 notify_on_failure = ?9, updated_at = ?10
             WHERE id = ?1",
            params![
                task.id,
                task.name,
                task.script_path,
                schedule_json,
                task.enabled,
                task.retry_count,
                task.retry_delay_minutes,
                task.notify_on_success,
                task.notify_on_failure,
                task.updated_at,
            ],
        )?;
        if n == 0 {
            return Err(StoreError::TaskNotFound {
                id: task.id.clone(),
            });
        }
        Ok(())
    }
}

/// Row as stored; the schedule is decoded outside the rusqlite closure so a
/// malformed value surfaces as [`StoreError::Corrupt`].
struct RawTask {
    task: Task,
    schedule_json: String,
}

impl RawTask {
    fn into_task(self) -> Result<Task> {
        let mut task = self.task;
        task.schedule = WeeklySchedule::from_json(&self.schedule_json).map_err(|e| {
            StoreError::Corrupt(format!("task {}: bad schedule: {e}", task.id))
        })?;
        Ok(task)
    }
}

fn row_to_raw_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTask> {
    Ok(RawTask {
        schedule_json: row.get(3)?,
        task: Task {
            id: row.get(0)?,
            name: row.get(1)?,
            script_path: row.get(2)?,
            schedule: WeeklySchedule::new(),
            enabled: row.get(4)?,
            retry_count: row.get::<_, i64>(5)?.max(0) as u32,
            retry_delay_minutes: row.get::<_, i64>(6)?.max(0) as u32,
            notify_on_success: row.get(7)?,
            notify_on_failure: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        },
    })
}
