use thiserror::Error;

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A task definition is invalid or incomplete. Never persisted.
    #[error("Invalid task configuration: {0}")]
    Configuration(String),

    /// No task with the given ID exists.
    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    /// No run with the given ID exists.
    #[error("Run not found: {id}")]
    RunNotFound { id: i64 },

    /// No run/stop request with the given ID exists.
    #[error("Request not found: {id}")]
    RequestNotFound { id: i64 },

    /// Requested concurrency limit is outside the accepted range.
    #[error("Concurrency limit {value} is outside {min}..={max}")]
    ConcurrencyLimit { value: i64, min: usize, max: usize },

    /// A stored row could not be decoded (e.g. malformed schedule JSON).
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// Another thread panicked while holding the connection.
    #[error("Database connection lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Short error code string for machine-readable output.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Database(_) | StoreError::Poisoned => "PERSISTENCE_ERROR",
            StoreError::Configuration(_) => "CONFIGURATION_ERROR",
            StoreError::TaskNotFound { .. }
            | StoreError::RunNotFound { .. }
            | StoreError::RequestNotFound { .. } => "NOT_FOUND",
            StoreError::ConcurrencyLimit { .. } => "CONCURRENCY_LIMIT_ERROR",
            StoreError::Corrupt(_) => "CORRUPT_RECORD",
        }
    }

    /// True for errors caused by the store being unavailable rather than by
    /// the request itself.
    pub fn is_persistence(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Poisoned)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
