use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use taskwarden_store::{DayOfWeek, Result as StoreResult, Task, TimeOfDay};

type Slots = HashMap<(DayOfWeek, TimeOfDay), BTreeSet<String>>;

/// (day, time) → ids of enabled tasks due in that minute.
///
/// Rebuilt wholesale from the full task list and swapped in under a short
/// write lock; readers only ever see a complete map.
#[derive(Default)]
pub struct TriggerIndex {
    slots: RwLock<Arc<Slots>>,
    stale: AtomicBool,
}

impl TriggerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the index with one built from `tasks`. Disabled tasks are
    /// left out.
    pub fn rebuild(&self, tasks: &[Task]) {
        let mut slots = Slots::new();
        for task in tasks.iter().filter(|t| t.enabled) {
            for slot in task.schedule.slots() {
                slots.entry(slot).or_default().insert(task.id.clone());
            }
        }
        let entries = slots.len();
        let fresh = Arc::new(slots);
        match self.slots.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
        self.stale.store(false, Ordering::Release);
        debug!(entries, "trigger index rebuilt");
    }

    /// Rebuild from a store read. On failure the previous index stays in
    /// place and is flagged stale so the scheduler retries.
    pub fn refresh(&self, load: impl FnOnce() -> StoreResult<Vec<Task>>) -> bool {
        match load() {
            Ok(tasks) => {
                self.rebuild(&tasks);
                true
            }
            Err(e) => {
                warn!(error = %e, "trigger index rebuild failed, keeping previous index");
                self.stale.store(true, Ordering::Release);
                false
            }
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Task ids due at `(day, time)`, in id order.
    pub fn lookup(&self, day: DayOfWeek, time: TimeOfDay) -> Vec<String> {
        self.snapshot()
            .get(&(day, time))
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn snapshot(&self) -> Arc<Slots> {
        match self.slots.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskwarden_store::{StoreError, WeeklySchedule};

    fn task(id: &str, enabled: bool, schedule: WeeklySchedule) -> Task {
        Task {
            id: id.into(),
            name: id.into(),
            script_path: "/bin/true".into(),
            schedule,
            enabled,
            retry_count: 0,
            retry_delay_minutes: 5,
            notify_on_success: false,
            notify_on_failure: true,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    #[test]
    fn indexes_enabled_tasks_only() {
        let mon = DayOfWeek::MONDAY;
        let index = TriggerIndex::new();
        index.rebuild(&[
            task("a", true, WeeklySchedule::new().at(mon, t("09:00"))),
            task("b", true, WeeklySchedule::new().at(mon, t("09:00")).at(mon, t("10:00"))),
            task("c", false, WeeklySchedule::new().at(mon, t("09:00"))),
        ]);
        assert_eq!(index.lookup(mon, t("09:00")), ["a", "b"]);
        assert_eq!(index.lookup(mon, t("10:00")), ["b"]);
        assert!(index.lookup(DayOfWeek::SUNDAY, t("09:00")).is_empty());
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn rebuild_replaces_wholesale() {
        let mon = DayOfWeek::MONDAY;
        let index = TriggerIndex::new();
        index.rebuild(&[task("a", true, WeeklySchedule::new().at(mon, t("09:00")))]);
        index.rebuild(&[task("a", true, WeeklySchedule::new().at(mon, t("11:00")))]);
        assert!(index.lookup(mon, t("09:00")).is_empty());
        assert_eq!(index.lookup(mon, t("11:00")), ["a"]);
    }

    #[test]
    fn failed_refresh_keeps_previous_and_marks_stale() {
        let mon = DayOfWeek::MONDAY;
        let index = TriggerIndex::new();
        index.rebuild(&[task("a", true, WeeklySchedule::new().at(mon, t("09:00")))]);

        assert!(!index.refresh(|| Err(StoreError::Poisoned)));
        assert!(index.is_stale());
        assert_eq!(index.lookup(mon, t("09:00")), ["a"]);

        assert!(index.refresh(|| Ok(vec![])));
        assert!(!index.is_stale());
        assert!(index.is_empty());
    }
}
