//! `taskwarden-engine`: scheduling and bounded-concurrency execution of
//! external task processes.
//!
//! # Pieces
//!
//! | Module        | Role                                                        |
//! |---------------|-------------------------------------------------------------|
//! | [`trigger`]   | (day, minute) → task ids, rebuilt after every task change   |
//! | [`scheduler`] | ticks, looks up due tasks, queues them once per minute      |
//! | [`dispatch`]  | FIFO admission queue capped by the concurrency limit        |
//! | [`worker`]    | runs one firing: attempts, retries, ledger rows, notices    |
//! | [`spawner`]   | process seam ([`ProcessSpawner`]), tokio implementation     |
//! | [`notify`]    | notification seam ([`NotificationSink`])                    |
//! | [`engine`]    | the facade that owns all of the above                       |

pub mod command;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod notify;
pub mod scheduler;
pub mod spawner;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod trigger;
pub mod truncate;
pub mod worker;

pub use command::CommandLine;
pub use dispatch::{CancelOutcome, DispatchSnapshot, EnqueueOutcome};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use notify::{CommandNotifier, LogNotifier, NotificationSink};
pub use spawner::{
    OutputLine, OutputStream, ProcessHandle, ProcessSpawner, SpawnedProcess, TokioSpawner,
};
pub use worker::{FiringReport, FiringStatus};
