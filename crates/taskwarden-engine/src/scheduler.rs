use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use taskwarden_store::{DayOfWeek, RunTrigger, TaskStore, TimeOfDay};

use crate::dispatch::{Dispatcher, EnqueueOutcome};
use crate::trigger::TriggerIndex;

/// Periodic matcher: turns due (day, minute) slots into queue admissions.
pub struct Scheduler {
    index: Arc<TriggerIndex>,
    dispatcher: Arc<Dispatcher>,
    tasks: TaskStore,
    /// Last minute slot that was looked up. A slot is processed at most once.
    last_slot: Option<NaiveDateTime>,
    /// Store `data_version` the index was last built against.
    data_version: Option<i64>,
}

impl Scheduler {
    pub fn new(index: Arc<TriggerIndex>, dispatcher: Arc<Dispatcher>, tasks: TaskStore) -> Self {
        Self {
            index,
            dispatcher,
            tasks,
            last_slot: None,
            data_version: None,
        }
    }

    /// Whether another connection committed since the last check. Edits made
    /// through this process refresh the index themselves; this catches the
    /// ones made by other processes sharing the database file.
    fn store_changed(&mut self) -> bool {
        match self.tasks.data_version() {
            Ok(version) => {
                let changed = self.data_version != Some(version);
                self.data_version = Some(version);
                changed
            }
            Err(e) => {
                warn!(error = %e, "cannot read store version");
                false
            }
        }
    }

    /// Process the minute containing `now`. Returns the ids newly queued.
    pub async fn tick_at(&mut self, now: NaiveDateTime) -> Vec<String> {
        if self.store_changed() || self.index.is_stale() {
            let tasks = &self.tasks;
            if self.index.refresh(|| tasks.list_tasks()) {
                debug!(entries = self.index.len(), "trigger index refreshed");
            }
        }

        let Some(slot) = now.with_second(0).and_then(|t| t.with_nanosecond(0)) else {
            return Vec::new();
        };
        if self.last_slot == Some(slot) {
            return Vec::new();
        }
        self.last_slot = Some(slot);

        let day = DayOfWeek::from(slot.weekday());
        let time = TimeOfDay::of(&slot);
        let due = self.index.lookup(day, time);
        if due.is_empty() {
            return due;
        }
        debug!(%day, %time, count = due.len(), "tasks due");

        let mut queued = Vec::with_capacity(due.len());
        for task_id in due {
            if self.dispatcher.enqueue(&task_id, RunTrigger::Scheduled).await
                == EnqueueOutcome::Queued
            {
                queued.push(task_id);
            }
        }
        queued
    }

    /// Tick every `period` against the local clock until `shutdown` flips.
    pub async fn run(mut self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(period_secs = period.as_secs(), "scheduler loop started");
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick_at(Local::now().naive_local()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use taskwarden_store::{ConcurrencyLimit, Database, NewTask, WeeklySchedule};

    // 2026-10-12 is a Monday.
    fn monday(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 12)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn setup(ids: &[&str]) -> (Scheduler, Arc<Dispatcher>) {
        let db = Database::open_in_memory().unwrap();
        let schedule = WeeklySchedule::new().at(DayOfWeek::MONDAY, TimeOfDay::new(9, 0).unwrap());
        for id in ids {
            db.tasks()
                .create_task(
                    NewTask::new(*id, "/bin/true")
                        .with_id(*id)
                        .with_schedule(schedule.clone()),
                )
                .unwrap();
        }
        let index = Arc::new(TriggerIndex::new());
        index.rebuild(&db.tasks().list_tasks().unwrap());
        let dispatcher = Arc::new(Dispatcher::new(ConcurrencyLimit::new(1).unwrap()));
        let scheduler = Scheduler::new(index, dispatcher.clone(), db.tasks());
        (scheduler, dispatcher)
    }

    #[tokio::test]
    async fn fires_at_most_once_per_minute() {
        let (mut scheduler, dispatcher) = setup(&["a"]);
        assert_eq!(scheduler.tick_at(monday(9, 0, 3)).await, ["a"]);
        // Later ticks in the same minute do nothing, even after the run ended.
        let slot = dispatcher.admit().await.remove(0);
        dispatcher.complete("a", slot.ticket).await;
        assert!(scheduler.tick_at(monday(9, 0, 18)).await.is_empty());
        assert!(scheduler.tick_at(monday(9, 0, 59)).await.is_empty());
        assert!(dispatcher.is_idle().await);
    }

    #[tokio::test]
    async fn non_matching_minutes_queue_nothing() {
        let (mut scheduler, dispatcher) = setup(&["a"]);
        assert!(scheduler.tick_at(monday(8, 59, 45)).await.is_empty());
        assert!(scheduler.tick_at(monday(9, 1, 0)).await.is_empty());
        assert!(dispatcher.is_idle().await);
    }

    #[tokio::test]
    async fn same_minute_tasks_queue_in_id_order() {
        let (mut scheduler, dispatcher) = setup(&["b", "a"]);
        assert_eq!(scheduler.tick_at(monday(9, 0, 0)).await, ["a", "b"]);
        let snap = dispatcher.snapshot().await;
        assert_eq!(snap.pending.len(), 2);
        assert_eq!(snap.pending[0].task_id, "a");
    }

    #[tokio::test]
    async fn already_running_task_is_not_requeued() {
        let (mut scheduler, dispatcher) = setup(&["a"]);
        dispatcher.enqueue("a", RunTrigger::Manual).await;
        dispatcher.admit().await;
        assert!(scheduler.tick_at(monday(9, 0, 0)).await.is_empty());
        assert!(dispatcher.snapshot().await.pending.is_empty());
    }

    #[tokio::test]
    async fn edits_from_another_connection_are_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskwarden.db");
        let serving = Database::open(&path).unwrap();
        let editor = Database::open(&path).unwrap();

        let dispatcher = Arc::new(Dispatcher::new(ConcurrencyLimit::new(3).unwrap()));
        let mut scheduler =
            Scheduler::new(Arc::new(TriggerIndex::new()), dispatcher.clone(), serving.tasks());
        assert!(scheduler.tick_at(monday(8, 58, 0)).await.is_empty());

        let schedule = WeeklySchedule::new().at(DayOfWeek::MONDAY, TimeOfDay::new(9, 0).unwrap());
        editor
            .tasks()
            .create_task(
                NewTask::new("late", "/bin/true")
                    .with_id("late")
                    .with_schedule(schedule),
            )
            .unwrap();
        assert_eq!(scheduler.tick_at(monday(9, 0, 0)).await, ["late"]);

        let slot = dispatcher.admit().await.remove(0);
        dispatcher.complete("late", slot.ticket).await;
        editor.tasks().set_enabled("late", false).unwrap();
        let next_monday = monday(9, 0, 0) + chrono::Duration::weeks(1);
        assert!(scheduler.tick_at(next_monday).await.is_empty());
        assert!(dispatcher.is_idle().await);
    }
}
