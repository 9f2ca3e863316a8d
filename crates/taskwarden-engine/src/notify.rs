use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use taskwarden_core::config::NotifyConfig;

use crate::error::{EngineError, Result};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Where terminal outcomes are reported. The engine decides when to call
/// it; rendering and delivery belong to the sink.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, title: &str, message: &str) -> Result<()>;
}

/// Writes notifications to the tracing log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, title: &str, message: &str) -> Result<()> {
        info!(%title, %message, "notification");
        Ok(())
    }
}

/// Runs an external command with the title and message appended as the last
/// two arguments (`notify-send`, a webhook script, ...).
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    argv: Vec<String>,
}

impl CommandNotifier {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() {
            return Err(EngineError::Config("notify.command must not be empty".into()));
        }
        Ok(Self { argv })
    }
}

#[async_trait]
impl NotificationSink for CommandNotifier {
    async fn notify(&self, title: &str, message: &str) -> Result<()> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| EngineError::Notify("empty notifier command".into()))?;
        let child = Command::new(program)
            .args(args)
            .arg(title)
            .arg(message)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Notify(format!("cannot start {program}: {e}")))?;

        let output = tokio::time::timeout(NOTIFY_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| EngineError::Notify(format!("{program} timed out")))??;
        if !output.status.success() {
            return Err(EngineError::Notify(format!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Build the sink described by `[notify]`.
pub fn from_config(config: &NotifyConfig) -> Result<Arc<dyn NotificationSink>> {
    match &config.command {
        Some(argv) => Ok(Arc::new(CommandNotifier::new(argv.clone())?)),
        None => Ok(Arc::new(LogNotifier)),
    }
}
