use taskwarden_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the engine facade and its collaborators.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The process could not be started (missing script, bad program path).
    #[error("Failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    /// The process ran but did not exit cleanly.
    #[error("Process exited with code {code}")]
    Runtime { code: i32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Notification failed: {0}")]
    Notify(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Short, stable error code for machine-readable output.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Store(e) => e.code(),
            EngineError::Spawn { .. } => "PROCESS_SPAWN_ERROR",
            EngineError::Runtime { .. } => "PROCESS_RUNTIME_ERROR",
            EngineError::Io(_) => "IO_ERROR",
            EngineError::Notify(_) => "NOTIFY_ERROR",
            EngineError::Config(_) => "CONFIG_ERROR",
        }
    }
}

impl From<taskwarden_core::CoreError> for EngineError {
    fn from(e: taskwarden_core::CoreError) -> Self {
        EngineError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
