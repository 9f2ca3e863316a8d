//! Scripted collaborators for tests and dry runs.
//!
//! [`FakeSpawner`] plays back a queue of [`FakeRun`]s instead of starting
//! processes; [`RecordingNotifier`] keeps every notification in memory.

use std::collections::VecDeque;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use taskwarden_store::exit_code;

use crate::command::CommandLine;
use crate::error::{EngineError, Result};
use crate::notify::NotificationSink;
use crate::spawner::{OutputLine, OutputStream, ProcessHandle, ProcessSpawner, SpawnedProcess};

/// Behaviour of one spawn call.
#[derive(Debug, Clone)]
pub enum FakeRun {
    /// Print `output` on stdout and exit immediately with the code.
    Exit(i32, &'static str),
    /// Fail to start.
    SpawnFail,
    /// Print `output`, then run until killed.
    Hang(&'static str),
    /// Exit with the code after the delay (tokio time, so pausable).
    Slow(i32, Duration),
    /// Print this many numbered lines (`line 0`, `line 1`, ...) and exit 0.
    Chatty(usize),
}

/// Plays back [`FakeRun`]s in order; once the script is empty every spawn
/// exits 0.
#[derive(Default)]
pub struct FakeSpawner {
    script: Mutex<VecDeque<FakeRun>>,
    spawned: Mutex<Vec<(CommandLine, Instant)>>,
}

impl FakeSpawner {
    pub fn new(runs: impl IntoIterator<Item = FakeRun>) -> Self {
        Self {
            script: Mutex::new(runs.into_iter().collect()),
            spawned: Mutex::new(Vec::new()),
        }
    }

    pub fn spawn_count(&self) -> usize {
        relock(&self.spawned).len()
    }

    /// Command lines seen so far, in spawn order.
    pub fn spawned(&self) -> Vec<CommandLine> {
        relock(&self.spawned).iter().map(|(c, _)| c.clone()).collect()
    }

    /// When each spawn happened, on the tokio clock.
    pub fn spawn_times(&self) -> Vec<Instant> {
        relock(&self.spawned).iter().map(|(_, at)| *at).collect()
    }
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct FakeHandle {
    /// `None` means run until killed.
    exit: Option<(i32, Duration)>,
    killed: CancellationToken,
}

#[async_trait]
impl ProcessHandle for FakeHandle {
    async fn wait(&mut self) -> io::Result<i32> {
        match self.exit {
            Some((code, delay)) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(code),
                    _ = self.killed.cancelled() => Ok(exit_code::SIGNALLED),
                }
            }
            None => {
                self.killed.cancelled().await;
                Ok(exit_code::SIGNALLED)
            }
        }
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.killed.cancel();
        Ok(())
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, command: &CommandLine) -> Result<SpawnedProcess> {
        relock(&self.spawned).push((command.clone(), Instant::now()));
        let run = relock(&self.script)
            .pop_front()
            .unwrap_or(FakeRun::Exit(0, ""));
        let mut lines = 0;
        let (exit, text) = match run {
            FakeRun::SpawnFail => {
                return Err(EngineError::Spawn {
                    program: command.program.clone(),
                    reason: "No such file or directory".into(),
                })
            }
            FakeRun::Exit(code, text) => (Some((code, Duration::ZERO)), text),
            FakeRun::Slow(code, delay) => (Some((code, delay)), ""),
            FakeRun::Hang(text) => (None, text),
            FakeRun::Chatty(count) => {
                lines = count;
                (Some((0, Duration::ZERO)), "")
            }
        };

        let (tx, rx) = mpsc::channel(16);
        if !text.is_empty() {
            // Fresh channel with spare capacity, cannot be full.
            let _ = tx.try_send(OutputLine {
                stream: OutputStream::Stdout,
                text: text.to_string(),
            });
        }
        let killed = CancellationToken::new();
        if lines > 0 {
            tokio::spawn(async move {
                for i in 0..lines {
                    let line = OutputLine {
                        stream: OutputStream::Stdout,
                        text: format!("line {i}\n"),
                    };
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        } else if exit.is_none() {
            // A hanging process keeps its pipes open until killed.
            let killed = killed.clone();
            tokio::spawn(async move {
                killed.cancelled().await;
                drop(tx);
            });
        }
        Ok(SpawnedProcess {
            pid: None,
            output: rx,
            handle: Box::new(FakeHandle { exit, killed }),
        })
    }
}

/// Keeps (title, message) pairs in arrival order.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(String, String)> {
        relock(&self.sent).clone()
    }

    pub fn titles(&self) -> Vec<String> {
        relock(&self.sent).iter().map(|(t, _)| t.clone()).collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, title: &str, message: &str) -> Result<()> {
        relock(&self.sent).push((title.to_string(), message.to_string()));
        Ok(())
    }
}
