//! Admission queue and dispatcher state.
//!
//! Every change to `pending`, `running` or the limit happens under one
//! async mutex, which is what keeps `running.len() <= limit` true at all
//! times. Workers themselves are launched by the engine from the slots
//! [`Dispatcher::admit`] hands out.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use taskwarden_store::{ConcurrencyLimit, RunTrigger};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub task_id: String,
    pub trigger: RunTrigger,
}

/// A slot handed to the engine. `ticket` must be passed back to
/// [`Dispatcher::complete`].
#[derive(Debug, Clone)]
pub struct Admitted {
    pub task_id: String,
    pub trigger: RunTrigger,
    pub ticket: u64,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Queued,
    AlreadyPending,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Removed from the pending queue before it started.
    Dequeued,
    /// Running firing signalled to stop; its slot is free.
    Stopped,
    NotActive,
}

#[derive(Debug)]
struct RunningSlot {
    ticket: u64,
    cancel: CancellationToken,
    admitted_at: DateTime<Utc>,
    trigger: RunTrigger,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunningEntry {
    pub task_id: String,
    pub trigger: RunTrigger,
    pub admitted_at: DateTime<Utc>,
}

/// Point-in-time view of the queue for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchSnapshot {
    pub limit: usize,
    pub pending: Vec<Admission>,
    pub running: Vec<RunningEntry>,
}

#[derive(Debug)]
struct DispatchState {
    pending: VecDeque<Admission>,
    running: HashMap<String, RunningSlot>,
    limit: usize,
    next_ticket: u64,
}

impl DispatchState {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.running.is_empty()
    }
}

pub struct Dispatcher {
    state: Mutex<DispatchState>,
    /// Something may be admissible: enqueue, completion, limit change.
    wake: Notify,
    /// A slot was released or the queue changed; used by `wait_idle`.
    settled: Notify,
}

impl Dispatcher {
    pub fn new(limit: ConcurrencyLimit) -> Self {
        Self {
            state: Mutex::new(DispatchState {
                pending: VecDeque::new(),
                running: HashMap::new(),
                limit: limit.get(),
                next_ticket: 1,
            }),
            wake: Notify::new(),
            settled: Notify::new(),
        }
    }

    /// Queue a firing unless the task is already pending or running.
    pub async fn enqueue(&self, task_id: &str, trigger: RunTrigger) -> EnqueueOutcome {
        let mut state = self.state.lock().await;
        if state.running.contains_key(task_id) {
            debug!(task_id, "already running, not queued");
            return EnqueueOutcome::AlreadyRunning;
        }
        if state.pending.iter().any(|a| a.task_id == task_id) {
            debug!(task_id, "already pending, not queued");
            return EnqueueOutcome::AlreadyPending;
        }
        state.pending.push_back(Admission {
            task_id: task_id.to_string(),
            trigger,
        });
        drop(state);
        info!(task_id, %trigger, "task queued");
        self.wake.notify_one();
        EnqueueOutcome::Queued
    }

    /// Move pending admissions into running slots, oldest first, while
    /// there is room under the limit.
    pub async fn admit(&self) -> Vec<Admitted> {
        let mut state = self.state.lock().await;
        let mut admitted = Vec::new();
        while state.running.len() < state.limit {
            let Some(next) = state.pending.pop_front() else {
                break;
            };
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            let cancel = CancellationToken::new();
            state.running.insert(
                next.task_id.clone(),
                RunningSlot {
                    ticket,
                    cancel: cancel.clone(),
                    admitted_at: Utc::now(),
                    trigger: next.trigger,
                },
            );
            admitted.push(Admitted {
                task_id: next.task_id,
                trigger: next.trigger,
                ticket,
                cancel,
            });
        }
        admitted
    }

    /// Release a slot. Ignored unless `ticket` is the slot's current one, so
    /// a worker that was stopped cannot free a later firing's slot.
    pub async fn complete(&self, task_id: &str, ticket: u64) -> bool {
        let mut state = self.state.lock().await;
        let matches = state
            .running
            .get(task_id)
            .is_some_and(|slot| slot.ticket == ticket);
        if matches {
            state.running.remove(task_id);
        }
        drop(state);
        if matches {
            self.wake.notify_one();
            self.settled.notify_waiters();
        }
        matches
    }

    /// Drop a pending firing, or stop a running one and free its slot now.
    pub async fn cancel(&self, task_id: &str) -> CancelOutcome {
        let mut state = self.state.lock().await;
        let outcome = if let Some(pos) = state.pending.iter().position(|a| a.task_id == task_id) {
            state.pending.remove(pos);
            CancelOutcome::Dequeued
        } else if let Some(slot) = state.running.remove(task_id) {
            slot.cancel.cancel();
            CancelOutcome::Stopped
        } else {
            CancelOutcome::NotActive
        };
        drop(state);
        if outcome != CancelOutcome::NotActive {
            info!(task_id, ?outcome, "task stop requested");
            self.wake.notify_one();
            self.settled.notify_waiters();
        }
        outcome
    }

    /// Stop everything: clear the queue and cancel every running slot.
    /// Returns the number of running firings that were signalled.
    pub async fn cancel_all(&self) -> usize {
        let mut state = self.state.lock().await;
        state.pending.clear();
        let stopped = state.running.len();
        for (_, slot) in state.running.drain() {
            slot.cancel.cancel();
        }
        drop(state);
        self.settled.notify_waiters();
        stopped
    }

    /// Change the limit. Running firings are never preempted; a lower limit
    /// only holds back new admissions.
    pub async fn set_limit(&self, limit: ConcurrencyLimit) {
        self.state.lock().await.limit = limit.get();
        self.wake.notify_one();
    }

    pub async fn limit(&self) -> usize {
        self.state.lock().await.limit
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running.len()
    }

    pub async fn snapshot(&self) -> DispatchSnapshot {
        let state = self.state.lock().await;
        let mut running: Vec<RunningEntry> = state
            .running
            .iter()
            .map(|(task_id, slot)| RunningEntry {
                task_id: task_id.clone(),
                trigger: slot.trigger,
                admitted_at: slot.admitted_at,
            })
            .collect();
        running.sort_by(|a, b| a.admitted_at.cmp(&b.admitted_at));
        DispatchSnapshot {
            limit: state.limit,
            pending: state.pending.iter().cloned().collect(),
            running,
        }
    }

    pub async fn is_idle(&self) -> bool {
        self.state.lock().await.is_idle()
    }

    /// Resolve once nothing is pending and no slot is held.
    pub async fn wait_idle(&self) {
        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();
            if self.is_idle().await {
                return;
            }
            settled.await;
        }
    }

    /// Sleep until woken or `period` elapses, whichever is first.
    pub async fn wait_for_work(&self, period: Duration) {
        tokio::select! {
            _ = self.wake.notified() => {}
            _ = tokio::time::sleep(period) => {}
        }
    }
}
