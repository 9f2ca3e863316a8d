//! Process spawning seam.
//!
//! The worker only talks to [`ProcessSpawner`] / [`ProcessHandle`]; tests
//! swap in scripted fakes, production uses [`TokioSpawner`].

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use taskwarden_store::exit_code;

use crate::command::CommandLine;
use crate::error::{EngineError, Result};

/// Lines buffered between the pipe readers and the worker.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Longest chunk forwarded as one line; longer lines arrive in pieces.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of process output, newline included when the process wrote one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Control over a running process.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Wait for exit and return the exit code. Must be cancel safe: the
    /// worker polls it inside `select!` and may call it again.
    async fn wait(&mut self) -> io::Result<i32>;

    /// Kill the process and everything it started.
    async fn kill(&mut self) -> io::Result<()>;
}

pub struct SpawnedProcess {
    pub pid: Option<u32>,
    /// Closed once both stdout and stderr reach EOF.
    pub output: mpsc::Receiver<OutputLine>,
    pub handle: Box<dyn ProcessHandle>,
}

pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, command: &CommandLine) -> Result<SpawnedProcess>;
}

/// Spawns real OS processes with piped, line-streamed output.
///
/// On unix each child leads its own process group so a kill reaches the
/// whole tree.
#[derive(Debug, Default, Clone)]
pub struct TokioSpawner;

impl ProcessSpawner for TokioSpawner {
    fn spawn(&self, command: &CommandLine) -> Result<SpawnedProcess> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| EngineError::Spawn {
            program: command.program.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id();
        debug!(pid, command = %command, "process spawned");

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, OutputStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, OutputStream::Stderr, tx));
        }

        Ok(SpawnedProcess {
            pid,
            output: rx,
            handle: Box::new(TokioHandle { child, pid }),
        })
    }
}

/// Read `reader` line by line (lossy UTF-8) until EOF or the receiver is gone.
/// A line without a newline within [`MAX_LINE_BYTES`] is cut into chunks.
async fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_LINE_BYTES as u64)
            .read_until(b'\n', &mut buf)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) => {
                let line = OutputLine {
                    stream,
                    text: String::from_utf8_lossy(&buf).into_owned(),
                };
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(?stream, error = %e, "output read failed");
                break;
            }
        }
    }
}

struct TokioHandle {
    child: Child,
    pid: Option<u32>,
}

#[async_trait]
impl ProcessHandle for TokioHandle {
    async fn wait(&mut self) -> io::Result<i32> {
        let status = self.child.wait().await?;
        Ok(status.code().unwrap_or(exit_code::SIGNALLED))
    }

    async fn kill(&mut self) -> io::Result<()> {
        if let Some(pid) = self.pid {
            kill_tree(pid);
        }
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(unix)]
fn kill_tree(pid: u32) {
    // The child was started with process_group(0), so its pgid is its pid.
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        debug!(pid, error = %io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_tree(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}
