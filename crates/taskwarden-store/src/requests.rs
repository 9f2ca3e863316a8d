use chrono::{Duration, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::db::{lock, now_timestamp, SharedConnection};
use crate::error::{Result, StoreError};

const REQUEST_COLUMNS: &str =
    "id, task_id, kind, state, firing_status, exit_code, requested_at, handled_at";

/// What another process asks the serving process to do with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Run,
    Stop,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Run => "run",
            RequestKind::Stop => "stop",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "run" => Ok(RequestKind::Run),
            "stop" => Ok(RequestKind::Stop),
            other => Err(StoreError::Corrupt(format!("unknown request kind: {other}"))),
        }
    }
}

/// Lifecycle of a request row.
///
/// `pending` until the serving process picks it up. A run request that got
/// admitted moves to `queued` and then to `done` once its firing ends; every
/// other state is final as soon as it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Queued,
    AlreadyPending,
    AlreadyRunning,
    Stopped,
    NotActive,
    Failed,
    Done,
    /// The serving process went away before finishing it.
    Abandoned,
}

impl RequestState {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestState::Pending => "pending",
            RequestState::Queued => "queued",
            RequestState::AlreadyPending => "already_pending",
            RequestState::AlreadyRunning => "already_running",
            RequestState::Stopped => "stopped",
            RequestState::NotActive => "not_active",
            RequestState::Failed => "failed",
            RequestState::Done => "done",
            RequestState::Abandoned => "abandoned",
        }
    }

    /// Still waiting on the serving process.
    pub fn is_open(self) -> bool {
        matches!(self, RequestState::Pending | RequestState::Queued)
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RequestState::Pending),
            "queued" => Ok(RequestState::Queued),
            "already_pending" => Ok(RequestState::AlreadyPending),
            "already_running" => Ok(RequestState::AlreadyRunning),
            "stopped" => Ok(RequestState::Stopped),
            "not_active" => Ok(RequestState::NotActive),
            "failed" => Ok(RequestState::Failed),
            "done" => Ok(RequestState::Done),
            "abandoned" => Ok(RequestState::Abandoned),
            other => Err(StoreError::Corrupt(format!("unknown request state: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub id: i64,
    pub task_id: String,
    pub kind: RequestKind,
    pub state: RequestState,
    /// How the admitted firing ended, once `state` is `done`.
    pub firing_status: Option<String>,
    /// Exit code of the firing's last attempt, once `state` is `done`.
    pub exit_code: Option<i32>,
    pub requested_at: String,
    pub handled_at: Option<String>,
}

/// Run/stop requests written by short-lived processes and drained by the
/// process that holds the engine lease.
#[derive(Clone)]
pub struct RequestQueue {
    conn: SharedConnection,
}

impl RequestQueue {
    pub(crate) fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Record a new pending request and return its id.
    pub fn submit(&self, task_id: &str, kind: RequestKind) -> Result<i64> {
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
            "INSERT INTO run_requests (task_id, kind, requested_at) VALUES (?1, ?2, ?3)",
            params![task_id, kind.as_str(), now_timestamp()],
        )?;
        let id = db.last_insert_rowid();
        debug!(task_id, request_id = id, %kind, "request submitted");
        Ok(id)
    }

    pub fn get(&self, id: i64) -> Result<RunRequest> {
        let db = lock(&self.conn)?;
        let raw = db
            .query_row(
                &format!("SELECT {REQUEST_COLUMNS} FROM run_requests WHERE id = ?1"),
                [id],
                row_to_raw_request,
            )
            .optional()?;
        raw.ok_or(StoreError::RequestNotFound { id })?.into_request()
    }

    /// Requests nobody has picked up yet, oldest first.
    pub fn pending(&self) -> Result<Vec<RunRequest>> {
        let db = lock(&self.conn)?;
        let mut stmt = db.prepare(&format!(
            "SELECT {REQUEST_COLUMNS} FROM run_requests WHERE state = 'pending' ORDER BY id"
        ))?;
        let rows = stmt.query_map([], row_to_raw_request)?;
        let mut requests = Vec::new();
        for raw in rows {
            requests.push(raw?.into_request()?);
        }
        Ok(requests)
    }

    /// Move a pending request to `state`. Returns `false` if it was no longer
    /// pending.
    pub fn resolve(&self, id: i64, state: RequestState) -> Result<bool> {
        let db = lock(&self.conn)?;
        let changed = db.execute(
            "UPDATE run_requests SET state = ?2, handled_at = ?3
             WHERE id = ?1 AND state = 'pending'",
            params![id, state.as_str(), now_timestamp()],
        )?;
        Ok(changed == 1)
    }

    /// Mark a queued run request as done with the result of its firing.
    pub fn complete(&self, id: i64, firing_status: &str, exit_code: Option<i32>) -> Result<bool> {
        let db = lock(&self.conn)?;
        let changed = db.execute(
            "UPDATE run_requests
             SET state = 'done', firing_status = ?2, exit_code = ?3, handled_at = ?4
             WHERE id = ?1 AND state = 'queued'",
            params![id, firing_status, exit_code, now_timestamp()],
        )?;
        Ok(changed == 1)
    }

    /// Close every open request. Called by a process taking over the lease:
    /// whatever the previous holder accepted will never be answered.
    pub fn abandon_open(&self) -> Result<usize> {
        let db = lock(&self.conn)?;
        let changed = db.execute(
            "UPDATE run_requests SET state = 'abandoned', handled_at = ?1
             WHERE state IN ('pending', 'queued')",
            [now_timestamp()],
        )?;
        if changed > 0 {
            info!(count = changed, "abandoned open requests");
        }
        Ok(changed)
    }

    /// Delete closed requests older than `max_age`.
    pub fn prune(&self, max_age: Duration) -> Result<usize> {
        let cutoff = (Utc::now() - max_age).to_rfc3339_opts(SecondsFormat::Millis, true);
        let db = lock(&self.conn)?;
        let deleted = db.execute(
            "DELETE FROM run_requests
             WHERE state NOT IN ('pending', 'queued') AND requested_at < ?1",
            [cutoff],
        )?;
        Ok(deleted)
    }
}

struct RawRequest {
    id: i64,
    task_id: String,
    kind: String,
    state: String,
    firing_status: Option<String>,
    exit_code: Option<i32>,
    requested_at: String,
    handled_at: Option<String>,
}

impl RawRequest {
    fn into_request(self) -> Result<RunRequest> {
        Ok(RunRequest {
            id: self.id,
            task_id: self.task_id,
            kind: self.kind.parse()?,
            state: self.state.parse()?,
            firing_status: self.firing_status,
            exit_code: self.exit_code,
            requested_at: self.requested_at,
            handled_at: self.handled_at,
        })
    }
}

fn row_to_raw_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRequest> {
    Ok(RawRequest {
        id: row.get(0)?,
        task_id: row.get(1)?,
        kind: row.get(2)?,
        state: row.get(3)?,
        firing_status: row.get(4)?,
        exit_code: row.get(5)?,
        requested_at: row.get(6)?,
        handled_at: row.get(7)?,
    })
}
