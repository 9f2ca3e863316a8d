use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_TICK_SECS: u64 = 15;
pub const DEFAULT_DISPATCH_SECS: u64 = 1;
pub const DEFAULT_MAX_LOG_CHARS: usize = 200_000;
pub const DEFAULT_OUTPUT_GRACE_MS: u64 = 2_000;
pub const DEFAULT_LEASE_SECS: u64 = 30;
/// Schedules are expressed in whole minutes.
pub const SCHEDULE_GRANULARITY_SECS: u64 = 60;

/// Top-level config (taskwarden.toml + TASKWARDEN_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskwardenConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Timing knobs for the scheduler loop, the dispatcher and the workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Scheduler loop period. Must not exceed the one-minute schedule
    /// granularity or due minutes can be skipped.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Dispatcher period. Enqueue and completion also wake the dispatcher
    /// immediately, so this is only the fallback cadence.
    #[serde(default = "default_dispatch_secs")]
    pub dispatch_secs: u64,
    /// Optional wall-clock cap for a single attempt. Unset means no cap.
    #[serde(default)]
    pub max_run_secs: Option<u64>,
    /// Stored logs longer than this keep their head and tail only.
    #[serde(default = "default_max_log_chars")]
    pub max_log_chars: usize,
    /// How long to keep draining stdout/stderr after the process exited
    /// (descendants may still hold the pipes open).
    #[serde(default = "default_output_grace_ms")]
    pub output_grace_ms: u64,
    /// Lifetime of the claim the serving process holds on the database. It
    /// is renewed every third of this; a crashed holder blocks takeover for
    /// at most this long.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_secs: DEFAULT_TICK_SECS,
            dispatch_secs: DEFAULT_DISPATCH_SECS,
            max_run_secs: None,
            max_log_chars: DEFAULT_MAX_LOG_CHARS,
            output_grace_ms: DEFAULT_OUTPUT_GRACE_MS,
            lease_secs: DEFAULT_LEASE_SECS,
        }
    }
}

impl EngineConfig {
    /// Reject periods the loops cannot run with.
    ///
    /// A tick period longer than the schedule granularity is accepted with a
    /// warning: the loop still works but may miss a due minute.
    pub fn validate(&self) -> Result<()> {
        if self.tick_secs == 0 {
            return Err(CoreError::Config("engine.tick_secs must be > 0".into()));
        }
        if self.dispatch_secs == 0 {
            return Err(CoreError::Config("engine.dispatch_secs must be > 0".into()));
        }
        if self.lease_secs < 3 {
            return Err(CoreError::Config("engine.lease_secs must be >= 3".into()));
        }
        if self.max_run_secs == Some(0) {
            return Err(CoreError::Config(
                "engine.max_run_secs must be > 0 when set".into(),
            ));
        }
        if self.tick_secs > SCHEDULE_GRANULARITY_SECS {
            tracing::warn!(
                tick_secs = self.tick_secs,
                "tick period exceeds the one-minute schedule granularity; due minutes may be skipped"
            );
        }
        Ok(())
    }
}

/// How task scripts are turned into a process command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// File extension (lowercase, no dot) → argv prefix. The script path is
    /// appended as the last argument. Extensions not listed run directly.
    #[serde(default = "default_interpreters")]
    pub interpreters: BTreeMap<String, Vec<String>>,
    /// Working directory for spawned processes (defaults to the engine's cwd).
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interpreters: default_interpreters(),
            working_dir: None,
        }
    }
}

impl RunnerConfig {
    /// Interpreter argv for `extension`, matched case-insensitively.
    pub fn interpreter_for(&self, extension: &str) -> Option<&[String]> {
        let ext = extension.trim_start_matches('.').to_ascii_lowercase();
        self.interpreters
            .get(&ext)
            .filter(|argv| !argv.is_empty())
            .map(Vec::as_slice)
    }
}

/// Notification delivery. Without a command, notifications are only logged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// argv of an external notifier; title and message are appended.
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}
fn default_dispatch_secs() -> u64 {
    DEFAULT_DISPATCH_SECS
}
fn default_max_log_chars() -> usize {
    DEFAULT_MAX_LOG_CHARS
}
fn default_output_grace_ms() -> u64 {
    DEFAULT_OUTPUT_GRACE_MS
}
fn default_lease_secs() -> u64 {
    DEFAULT_LEASE_SECS
}

fn default_interpreters() -> BTreeMap<String, Vec<String>> {
    let argv = |parts: &[&str]| parts.iter().map(|p| p.to_string()).collect::<Vec<_>>();
    BTreeMap::from([
        ("py".to_string(), argv(&["python3", "-u"])),
        ("sh".to_string(), argv(&["sh"])),
        ("bat".to_string(), argv(&["cmd", "/C"])),
        ("cmd".to_string(), argv(&["cmd", "/C"])),
        ("vbs".to_string(), argv(&["cscript", "//nologo"])),
        ("ps1".to_string(), argv(&["powershell", "-File"])),
    ])
}

fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
}

fn default_db_path() -> String {
    format!("{}/.taskwarden/taskwarden.db", home_dir())
}

fn default_config_path() -> String {
    format!("{}/.taskwarden/taskwarden.toml", home_dir())
}

impl TaskwardenConfig {
    /// Load config from a TOML file with TASKWARDEN_* env var overrides.
    ///
    /// Path resolution: explicit argument, then `TASKWARDEN_CONFIG`, then
    /// `~/.taskwarden/taskwarden.toml`. A missing file yields the defaults.
    /// Nested keys in env vars are separated by `__`
    /// (`TASKWARDEN_ENGINE__TICK_SECS=10`).
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("TASKWARDEN_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        let config: TaskwardenConfig = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TASKWARDEN_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.engine.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let cfg = TaskwardenConfig::load(path.to_str()).unwrap();
        assert_eq!(cfg.engine.tick_secs, DEFAULT_TICK_SECS);
        assert_eq!(cfg.engine.max_run_secs, None);
        assert!(cfg.notify.command.is_none());
        assert!(cfg.runner.interpreter_for("py").is_some());
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[database]
path = "/tmp/tw-test.db"

[engine]
tick_secs = 5
max_run_secs = 600

[runner.interpreters]
rb = ["ruby"]
"#
        )
        .unwrap();

        let cfg = TaskwardenConfig::load(file.path().to_str()).unwrap();
        assert_eq!(cfg.database.path, "/tmp/tw-test.db");
        assert_eq!(cfg.engine.tick_secs, 5);
        assert_eq!(cfg.engine.max_run_secs, Some(600));
        assert_eq!(cfg.engine.dispatch_secs, DEFAULT_DISPATCH_SECS);
        // Dictionaries merge, so the built-in interpreters survive.
        assert_eq!(cfg.runner.interpreter_for("rb").unwrap(), ["ruby"]);
        assert_eq!(cfg.runner.interpreter_for("PY").unwrap()[0], "python3");
    }

    #[test]
    fn zero_tick_is_rejected() {
        let cfg = EngineConfig {
            tick_secs: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn lease_too_short_to_renew_is_rejected() {
        let cfg = EngineConfig {
            lease_secs: 1,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(CoreError::Config(_))));
        assert_eq!(EngineConfig::default().lease_secs, DEFAULT_LEASE_SECS);
    }

    #[test]
    fn long_tick_is_only_a_warning() {
        let cfg = EngineConfig {
            tick_secs: 90,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn unknown_extension_has_no_interpreter() {
        let runner = RunnerConfig::default();
        assert!(runner.interpreter_for("exe").is_none());
        assert!(runner.interpreter_for(".sh").is_some());
    }
}
