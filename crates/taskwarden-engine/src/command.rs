use std::fmt;
use std::path::{Path, PathBuf};

use taskwarden_core::config::RunnerConfig;

use crate::error::{EngineError, Result};

/// A fully resolved process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Turn a task's script path into a command line.
    ///
    /// Extensions with a configured interpreter run through it with the
    /// script appended; the script must exist. Anything else is executed
    /// directly and resolved by the OS.
    pub fn resolve(script_path: &str, runner: &RunnerConfig) -> Result<Self> {
        let path = Path::new(script_path);
        let interpreter = path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| runner.interpreter_for(ext));

        let mut command = match interpreter {
            Some(argv) => {
                if !path.is_file() {
                    return Err(EngineError::Spawn {
                        program: script_path.to_string(),
                        reason: "script not found".to_string(),
                    });
                }
                let (program, prefix) = argv.split_first().ok_or_else(|| {
                    EngineError::Config(format!("empty interpreter for {script_path}"))
                })?;
                let mut args = prefix.to_vec();
                args.push(script_path.to_string());
                CommandLine {
                    program: program.clone(),
                    args,
                    working_dir: None,
                }
            }
            None => CommandLine::new(script_path),
        };
        command.working_dir = runner.working_dir.as_ref().map(PathBuf::from);
        Ok(command)
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
