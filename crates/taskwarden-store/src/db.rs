use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use tracing::info;

use crate::error::{Result, StoreError};
use crate::lease::EngineLease;
use crate::requests::RequestQueue;
use crate::runs::RunLedger;
use crate::settings::SettingsStore;
use crate::tasks::TaskStore;

/// Settings key holding the concurrency limit.
pub const MAX_CONCURRENT_RUNS_KEY: &str = "max_concurrent_runs";

pub(crate) type SharedConnection = Arc<Mutex<Connection>>;

/// Initialise the schema.
///
/// Safe to call on every startup: uses `IF NOT EXISTS` throughout and only
/// seeds the concurrency setting when it is absent.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id                 TEXT    NOT NULL PRIMARY KEY,
            name               TEXT    NOT NULL,
            script_path        TEXT    NOT NULL,
            schedule_json      TEXT    NOT NULL,   -- {\"0\": [\"09:00\"]}, 0 = Monday
            enabled            INTEGER NOT NULL DEFAULT 1,
            retry_count        INTEGER NOT NULL DEFAULT 0,
            retry_delay        INTEGER NOT NULL DEFAULT 5,   -- minutes
            notify_on_success  INTEGER NOT NULL DEFAULT 0,
            notify_on_failure  INTEGER NOT NULL DEFAULT 1,
            created_at         TEXT    NOT NULL,
            updated_at         TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS runs (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id           TEXT    NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            attempt           INTEGER NOT NULL DEFAULT 1,
            trigger           TEXT    NOT NULL DEFAULT 'scheduled',
            start_time        TEXT    NOT NULL,   -- RFC3339 UTC, millis
            end_time          TEXT,               -- NULL until finalized
            duration_seconds  REAL,
            exit_code         INTEGER,
            outcome           TEXT,
            log_output        TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_runs_task_start
            ON runs(task_id, start_time DESC);
        CREATE INDEX IF NOT EXISTS idx_runs_start ON runs(start_time);

        CREATE TABLE IF NOT EXISTS settings (
            key    TEXT NOT NULL PRIMARY KEY,
            value  TEXT NOT NULL
        );

        INSERT OR IGNORE INTO settings (key, value) VALUES ('max_concurrent_runs', '3');

        -- run/stop requests from processes that do not own the queue
        CREATE TABLE IF NOT EXISTS run_requests (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id       TEXT    NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            kind          TEXT    NOT NULL,                    -- run | stop
            state         TEXT    NOT NULL DEFAULT 'pending',
            firing_status TEXT,                                -- set once state = done
            exit_code     INTEGER,
            requested_at  TEXT    NOT NULL,
            handled_at    TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_run_requests_state ON run_requests(state, id);

        -- single row: which process currently owns scheduling and admission
        CREATE TABLE IF NOT EXISTS engine_lease (
            id          INTEGER PRIMARY KEY CHECK (id = 1),
            owner       TEXT    NOT NULL,
            expires_at  TEXT    NOT NULL
        );
        ",
    )?;
    Ok(())
}

/// Handle to the engine database. Cheap to clone; all stores built from it
/// share one connection.
#[derive(Clone)]
pub struct Database {
    conn: SharedConnection,
}

impl Database {
    /// Open (or create) the database file, enable WAL and foreign keys, and
    /// initialise the schema. Parent directories are created as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Configuration(format!(
                    "cannot create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        init_db(&conn)?;
        info!(path = %path.display(), "database ready");
        Ok(Self::from_connection(conn))
    }

    /// Fresh in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        init_db(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn tasks(&self) -> TaskStore {
        TaskStore::new(self.conn.clone())
    }

    pub fn runs(&self) -> RunLedger {
        RunLedger::new(self.conn.clone())
    }

    pub fn settings(&self) -> SettingsStore {
        SettingsStore::new(self.conn.clone())
    }

    pub fn requests(&self) -> RequestQueue {
        RequestQueue::new(self.conn.clone())
    }

    pub fn lease(&self) -> EngineLease {
        EngineLease::new(self.conn.clone())
    }
}

/// Lock the shared connection, surfacing poisoning as an error instead of a
/// panic.
pub(crate) fn lock(conn: &SharedConnection) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|_| StoreError::Poisoned)
}

/// Current time in the stored timestamp format.
pub(crate) fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
