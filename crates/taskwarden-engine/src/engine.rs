use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use tokio::sync::{broadcast, watch};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use taskwarden_core::config::EngineConfig;
use taskwarden_core::TaskwardenConfig;
use taskwarden_store::{
    AggregateStats, ConcurrencyLimit, Database, EngineLease, LeaseHolder, NewTask, RequestKind,
    RequestQueue, RequestState, RunLedger, RunRecord, RunRequest, RunTrigger, SettingsStore, Task,
    TaskPatch, TaskStore,
};

use crate::dispatch::{Admitted, CancelOutcome, DispatchSnapshot, Dispatcher, EnqueueOutcome};
use crate::error::Result;
use crate::notify::{self, NotificationSink};
use crate::scheduler::Scheduler;
use crate::spawner::{ProcessSpawner, TokioSpawner};
use crate::trigger::TriggerIndex;
use crate::worker::{FiringReport, FiringStatus, Worker, WorkerSettings};

const REPORT_CHANNEL_CAPACITY: usize = 64;

/// Answered requests older than this are deleted while the lease is held.
const REQUEST_RETENTION_HOURS: i64 = 24;

/// The scheduling and execution engine.
///
/// Constructed once and shared behind an `Arc`. Query and mutation methods
/// can be called from anywhere; [`Engine::run`] drives the scheduler and
/// dispatcher loops until shutdown.
///
/// Several processes may open the same database, but only the one holding
/// the engine lease schedules and admits firings. The others hand run and
/// stop requests to it through the request queue.
pub struct Engine {
    tasks: TaskStore,
    ledger: RunLedger,
    settings: SettingsStore,
    requests: RequestQueue,
    lease: EngineLease,
    /// Identifies this process in the lease table.
    owner: String,
    /// Forwarded run requests waiting on a firing, by task id.
    awaiting: Mutex<HashMap<String, Vec<i64>>>,
    index: Arc<TriggerIndex>,
    dispatcher: Arc<Dispatcher>,
    worker: Arc<Worker>,
    workers: TaskTracker,
    reports: broadcast::Sender<FiringReport>,
    config: EngineConfig,
}

impl Engine {
    /// Build an engine over `db` with explicit collaborators.
    ///
    /// Loads the stored concurrency limit and builds the trigger index. Open
    /// runs are left alone; see [`Engine::recover_abandoned`].
    pub fn new(
        db: Database,
        config: &TaskwardenConfig,
        spawner: Arc<dyn ProcessSpawner>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Arc<Self>> {
        config.engine.validate()?;
        let tasks = db.tasks();
        let ledger = db.runs();
        let settings = db.settings();

        let limit = settings.concurrency_limit()?;
        let index = Arc::new(TriggerIndex::new());
        index.rebuild(&tasks.list_tasks()?);

        let worker = Worker::new(
            tasks.clone(),
            ledger.clone(),
            spawner,
            notifier,
            WorkerSettings::new(&config.engine, &config.runner),
        );
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        info!(limit = limit.get(), triggers = index.len(), "engine ready");

        Ok(Arc::new(Self {
            tasks,
            ledger,
            settings,
            requests: db.requests(),
            lease: db.lease(),
            owner: format!("{}-{}", std::process::id(), Uuid::new_v4()),
            awaiting: Mutex::new(HashMap::new()),
            index,
            dispatcher: Arc::new(Dispatcher::new(limit)),
            worker: Arc::new(worker),
            workers: TaskTracker::new(),
            reports,
            config: config.engine.clone(),
        }))
    }

    /// Real processes, notifications per `[notify]`.
    pub fn from_config(db: Database, config: &TaskwardenConfig) -> Result<Arc<Self>> {
        let notifier = notify::from_config(&config.notify)?;
        Self::new(db, config, Arc::new(TokioSpawner), notifier)
    }

    /// Finalize runs left open by a previous process as abandoned and close
    /// the requests it never answered. Call once, right after
    /// [`Engine::acquire_lease`] first succeeds; a process without the lease
    /// must not, or it would close the serving process's live runs.
    pub fn recover_abandoned(&self) -> Result<usize> {
        self.requests.abandon_open()?;
        Ok(self.ledger.abandon_unfinished()?)
    }

    // ── lease ───────────────────────────────────────────────────────────

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.config.lease_secs)
    }

    /// Take or renew the engine lease. `false` means another live process
    /// holds it and this one must not schedule or admit firings.
    pub fn acquire_lease(&self) -> Result<bool> {
        Ok(self.lease.acquire(&self.owner, self.lease_ttl())?)
    }

    pub fn release_lease(&self) -> Result<bool> {
        Ok(self.lease.release(&self.owner)?)
    }

    pub fn lease_holder(&self) -> Result<Option<LeaseHolder>> {
        Ok(self.lease.holder()?)
    }

    /// Renew the lease every third of its lifetime until `shutdown`, then
    /// release it. Also prunes old answered requests.
    async fn hold_lease(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.lease_ttl() / 3);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.acquire_lease() {
                        Ok(true) => {}
                        Ok(false) => {
                            error!(owner = %self.owner, "engine lease taken by another process");
                        }
                        Err(e) => warn!(error = %e, "lease renewal failed"),
                    }
                    let retention = chrono::Duration::hours(REQUEST_RETENTION_HOURS);
                    match self.requests.prune(retention) {
                        Ok(0) => {}
                        Ok(count) => debug!(count, "pruned answered requests"),
                        Err(e) => warn!(error = %e, "request pruning failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        match self.release_lease() {
            Ok(_) => info!(owner = %self.owner, "engine lease released"),
            Err(e) => warn!(error = %e, "lease release failed"),
        }
    }

    // ── tasks ────────────────────────────────────────────────────────────

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.tasks.list_tasks()?)
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        Ok(self.tasks.get_task(id)?)
    }

    pub fn create_task(&self, spec: NewTask) -> Result<Task> {
        let task = self.tasks.create_task(spec)?;
        self.refresh_triggers();
        Ok(task)
    }

    pub fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        let task = self.tasks.update_task(id, patch)?;
        self.refresh_triggers();
        Ok(task)
    }

    /// Delete a task and its run history. A queued firing of it is skipped
    /// when its turn comes.
    pub fn delete_task(&self, id: &str) -> Result<()> {
        self.tasks.delete_task(id)?;
        self.refresh_triggers();
        Ok(())
    }

    /// Flip `enabled`. Returns the updated task.
    pub fn toggle_enabled(&self, id: &str) -> Result<Task> {
        let current = self.tasks.get_task(id)?;
        let task = self.tasks.set_enabled(id, !current.enabled)?;
        self.refresh_triggers();
        Ok(task)
    }

    /// Next scheduled start of `task` in local time, `None` when disabled
    /// or unscheduled.
    pub fn next_run(&self, task: &Task) -> Option<NaiveDateTime> {
        self.next_run_after(task, Local::now().naive_local())
    }

    pub fn next_run_after(&self, task: &Task, from: NaiveDateTime) -> Option<NaiveDateTime> {
        if !task.enabled {
            return None;
        }
        task.schedule.next_after(from)
    }

    fn refresh_triggers(&self) {
        let tasks = &self.tasks;
        self.index.refresh(|| tasks.list_tasks());
    }

    // ── execution ───────────────────────────────────────────────────────

    /// Queue a manual firing. Unknown ids are rejected; a task that is
    /// already pending or running is not queued twice.
    #[instrument(skip(self))]
    pub async fn run_now(&self, id: &str) -> Result<EnqueueOutcome> {
        let task = self.tasks.get_task(id)?;
        Ok(self.dispatcher.enqueue(&task.id, RunTrigger::Manual).await)
    }

    /// Stop a pending or running firing.
    #[instrument(skip(self))]
    pub async fn stop_task(&self, id: &str) -> CancelOutcome {
        let outcome = self.dispatcher.cancel(id).await;
        if outcome == CancelOutcome::Dequeued {
            // No worker will report for it.
            self.answer_awaiting(id, FiringStatus::Cancelled, None);
        }
        outcome
    }

    /// Stop every firing and wait for the workers to record their runs.
    pub async fn stop_all(&self) -> usize {
        let stopped = self.dispatcher.cancel_all().await;
        self.workers.close();
        self.workers.wait().await;
        self.workers.reopen();
        let dropped: Vec<String> = relock(&self.awaiting).keys().cloned().collect();
        for task_id in dropped {
            self.answer_awaiting(&task_id, FiringStatus::Cancelled, None);
        }
        if stopped > 0 {
            info!(count = stopped, "stopped running tasks");
        }
        stopped
    }

    // ── forwarded requests ──────────────────────────────────────────────

    /// Ask the lease holder to fire `task_id` once. Returns the request id
    /// to poll with [`Engine::request`].
    pub fn request_run(&self, task_id: &str) -> Result<i64> {
        Ok(self.requests.submit(task_id, RequestKind::Run)?)
    }

    /// Ask the lease holder to stop `task_id`.
    pub fn request_stop(&self, task_id: &str) -> Result<i64> {
        Ok(self.requests.submit(task_id, RequestKind::Stop)?)
    }

    pub fn request(&self, id: i64) -> Result<RunRequest> {
        Ok(self.requests.get(id)?)
    }

    /// Apply pending requests from other processes through the same queue
    /// and limit as scheduled firings. Returns how many were handled.
    pub async fn drain_requests(&self) -> Result<usize> {
        let pending = self.requests.pending()?;
        for request in &pending {
            let task_id = request.task_id.as_str();
            let state = match request.kind {
                RequestKind::Run => {
                    // Registered first so a fast firing cannot finish unseen.
                    relock(&self.awaiting)
                        .entry(task_id.to_string())
                        .or_default()
                        .push(request.id);
                    let state = match self.run_now(task_id).await {
                        Ok(EnqueueOutcome::Queued) => RequestState::Queued,
                        Ok(EnqueueOutcome::AlreadyPending) => RequestState::AlreadyPending,
                        Ok(EnqueueOutcome::AlreadyRunning) => RequestState::AlreadyRunning,
                        Err(e) => {
                            warn!(request_id = request.id, task_id, error = %e,
                                "run request failed");
                            RequestState::Failed
                        }
                    };
                    if state != RequestState::Queued {
                        self.forget_awaiting(task_id, request.id);
                    }
                    state
                }
                RequestKind::Stop => match self.stop_task(task_id).await {
                    CancelOutcome::NotActive => RequestState::NotActive,
                    CancelOutcome::Dequeued | CancelOutcome::Stopped => RequestState::Stopped,
                },
            };
            self.requests.resolve(request.id, state)?;
            info!(
                request_id = request.id,
                task_id,
                kind = %request.kind,
                %state,
                "request handled"
            );
        }
        Ok(pending.len())
    }

    /// Close the forwarded run requests waiting on `task_id`'s firing.
    fn answer_awaiting(&self, task_id: &str, status: FiringStatus, exit_code: Option<i32>) {
        let Some(ids) = relock(&self.awaiting).remove(task_id) else {
            return;
        };
        for id in ids {
            if let Err(e) = self.requests.complete(id, status.as_str(), exit_code) {
                warn!(request_id = id, task_id, error = %e, "cannot answer request");
            }
        }
    }

    fn forget_awaiting(&self, task_id: &str, request_id: i64) {
        let mut awaiting = relock(&self.awaiting);
        if let Some(ids) = awaiting.get_mut(task_id) {
            ids.retain(|id| *id != request_id);
            if ids.is_empty() {
                awaiting.remove(task_id);
            }
        }
    }

    /// Reports of finished firings, as they complete.
    pub fn subscribe(&self) -> broadcast::Receiver<FiringReport> {
        self.reports.subscribe()
    }

    pub async fn status(&self) -> DispatchSnapshot {
        self.dispatcher.snapshot().await
    }

    /// Resolve once nothing is queued and no slot is held.
    pub async fn wait_idle(&self) {
        self.dispatcher.wait_idle().await;
    }

    /// A scheduler bound to this engine's index and queue. [`Engine::run`]
    /// drives one against the wall clock.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            Arc::clone(&self.index),
            Arc::clone(&self.dispatcher),
            self.tasks.clone(),
        )
    }

    /// Admit whatever fits under the limit and start a worker for each.
    /// Returns how many were started.
    pub async fn dispatch_once(self: &Arc<Self>) -> usize {
        let admitted = self.dispatcher.admit().await;
        let count = admitted.len();
        for slot in admitted {
            self.launch(slot);
        }
        count
    }

    fn launch(self: &Arc<Self>, slot: Admitted) {
        let engine = Arc::clone(self);
        self.workers.spawn(async move {
            let worker = Arc::clone(&engine.worker);
            let task_id = slot.task_id.clone();
            let trigger = slot.trigger;
            let cancel = slot.cancel.clone();
            // Own task so a panicking worker still releases its slot.
            let firing =
                tokio::spawn(async move { worker.run_firing(&task_id, trigger, &cancel).await });
            match firing.await {
                Ok(report) => {
                    if report.trigger == RunTrigger::Manual {
                        engine.answer_awaiting(
                            &report.task_id,
                            report.status,
                            report.last_exit_code(),
                        );
                    }
                    // No subscribers is fine.
                    let _ = engine.reports.send(report);
                }
                Err(e) => {
                    error!(task_id = %slot.task_id, error = %e, "worker task failed");
                    engine.answer_awaiting(&slot.task_id, FiringStatus::Abandoned, None);
                }
            }
            engine.dispatcher.complete(&slot.task_id, slot.ticket).await;
        });
    }

    /// Run the scheduler and dispatcher loops until `shutdown` becomes
    /// `true`. In-flight firings keep running; see [`Engine::stop_all`].
    ///
    /// Expects the lease to be held already (see [`Engine::acquire_lease`]);
    /// it is renewed while the loops run and released on shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!("engine started");
        let scheduler = self.scheduler().run(
            Duration::from_secs(self.config.tick_secs),
            shutdown.clone(),
        );
        let queue = self.clone().serve_queue(shutdown);
        tokio::join!(scheduler, queue);
        info!("engine stopped");
    }

    /// The admission half of [`Engine::run`], without the scheduler: hold the
    /// lease, pick up limit changes and forwarded requests, start workers.
    pub async fn serve_queue(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let lease = self.hold_lease(shutdown.clone());
        let dispatch = self.clone().dispatch_loop(shutdown);
        tokio::join!(lease, dispatch);
    }

    async fn dispatch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.config.dispatch_secs);
        loop {
            if let Err(e) = self.sync_limit().await {
                warn!(error = %e, "cannot read stored concurrency limit");
            }
            if let Err(e) = self.drain_requests().await {
                warn!(error = %e, "cannot drain requests");
            }
            self.dispatch_once().await;
            tokio::select! {
                _ = self.dispatcher.wait_for_work(period) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    // ── ledger & settings ───────────────────────────────────────────────

    pub fn list_runs_for_task(&self, task_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        self.tasks.get_task(task_id)?;
        Ok(self.ledger.list_runs_for_task(task_id, limit)?)
    }

    pub fn get_run(&self, run_id: i64) -> Result<RunRecord> {
        Ok(self.ledger.get_run(run_id)?)
    }

    pub fn get_run_log(&self, run_id: i64) -> Result<Option<String>> {
        Ok(self.ledger.get_log(run_id)?)
    }

    pub fn aggregate_stats(&self, window_hours: u32, top: usize) -> Result<AggregateStats> {
        Ok(self.ledger.aggregate_stats(window_hours, top)?)
    }

    pub fn concurrency_limit(&self) -> Result<ConcurrencyLimit> {
        Ok(self.settings.concurrency_limit()?)
    }

    /// Apply the stored limit if another process changed it.
    pub async fn sync_limit(&self) -> Result<ConcurrencyLimit> {
        let limit = self.settings.concurrency_limit()?;
        if self.dispatcher.limit().await != limit.get() {
            info!(limit = limit.get(), "concurrency limit changed in store");
            self.dispatcher.set_limit(limit).await;
        }
        Ok(limit)
    }

    /// Persist a new limit (1–10) and apply it to the dispatcher. Running
    /// firings are not interrupted when the limit drops.
    pub async fn set_concurrency_limit(&self, value: i64) -> Result<ConcurrencyLimit> {
        let limit = self.settings.set_concurrency_limit(value).inspect_err(|e| {
            warn!(value, error = %e, "concurrency limit rejected");
        })?;
        self.dispatcher.set_limit(limit).await;
        Ok(limit)
    }
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use taskwarden_store::{DayOfWeek, StoreError, TimeOfDay, WeeklySchedule};

    use crate::error::EngineError;
    use crate::testing::{FakeRun, FakeSpawner, RecordingNotifier};

    fn engine_with(runs: Vec<FakeRun>) -> (Arc<Engine>, Database) {
        let db = Database::open_in_memory().unwrap();
        let engine = Engine::new(
            db.clone(),
            &TaskwardenConfig::default(),
            Arc::new(FakeSpawner::new(runs)),
            Arc::new(RecordingNotifier::default()),
        )
        .unwrap();
        (engine, db)
    }

    fn monday_at(h: u8, m: u8) -> WeeklySchedule {
        WeeklySchedule::new().at(DayOfWeek::MONDAY, TimeOfDay::new(h, m).unwrap())
    }

    #[tokio::test]
    async fn mutations_refresh_the_trigger_index() {
        let (engine, _db) = engine_with(vec![]);
        let task = engine
            .create_task(NewTask::new("report", "/opt/report").with_schedule(monday_at(9, 0)))
            .unwrap();
        let nine = TimeOfDay::new(9, 0).unwrap();
        assert_eq!(engine.index.lookup(DayOfWeek::MONDAY, nine), [task.id.clone()]);

        engine
            .update_task(
                &task.id,
                TaskPatch {
                    schedule: Some(monday_at(10, 0)),
                    ..TaskPatch::default()
                },
            )
            .unwrap();
        assert!(engine.index.lookup(DayOfWeek::MONDAY, nine).is_empty());

        let toggled = engine.toggle_enabled(&task.id).unwrap();
        assert!(!toggled.enabled);
        assert!(engine.index.is_empty());

        engine.toggle_enabled(&task.id).unwrap();
        engine.delete_task(&task.id).unwrap();
        assert!(engine.index.is_empty());
    }

    #[tokio::test]
    async fn run_now_rejects_unknown_and_dedupes() {
        let (engine, _db) = engine_with(vec![]);
        assert!(matches!(
            engine.run_now("nope").await,
            Err(EngineError::Store(StoreError::TaskNotFound { .. }))
        ));
        let task = engine
            .create_task(NewTask::new("x", "/opt/x").with_schedule(monday_at(9, 0)))
            .unwrap();
        assert_eq!(engine.run_now(&task.id).await.unwrap(), EnqueueOutcome::Queued);
        assert_eq!(
            engine.run_now(&task.id).await.unwrap(),
            EnqueueOutcome::AlreadyPending
        );
        assert_eq!(engine.status().await.pending.len(), 1);
    }

    #[tokio::test]
    async fn concurrency_limit_is_validated_and_persisted() {
        let (engine, db) = engine_with(vec![]);
        assert_eq!(engine.concurrency_limit().unwrap().get(), 3);
        assert!(engine.set_concurrency_limit(0).await.is_err());
        assert_eq!(engine.status().await.limit, 3);

        engine.set_concurrency_limit(6).await.unwrap();
        assert_eq!(engine.status().await.limit, 6);
        assert_eq!(db.settings().concurrency_limit().unwrap().get(), 6);
    }

    #[tokio::test]
    async fn recovery_abandons_open_runs() {
        let db = Database::open_in_memory().unwrap();
        let task = db
            .tasks()
            .create_task(NewTask::new("x", "/opt/x").with_schedule(monday_at(9, 0)))
            .unwrap();
        let run_id = db.runs().create_run(&task.id, 1, RunTrigger::Scheduled).unwrap();

        let engine = Engine::new(
            db.clone(),
            &TaskwardenConfig::default(),
            Arc::new(FakeSpawner::default()),
            Arc::new(RecordingNotifier::default()),
        )
        .unwrap();
        // Construction alone leaves the run open.
        assert!(!db.runs().get_run(run_id).unwrap().is_finalized());

        assert_eq!(engine.recover_abandoned().unwrap(), 1);
        let run = db.runs().get_run(run_id).unwrap();
        assert_eq!(run.exit_code, Some(taskwarden_store::exit_code::ABANDONED));
        assert_eq!(engine.recover_abandoned().unwrap(), 0);
    }

    #[tokio::test]
    async fn next_run_skips_disabled_tasks() {
        let (engine, _db) = engine_with(vec![]);
        let task = engine
            .create_task(NewTask::new("x", "/opt/x").with_schedule(monday_at(9, 0)))
            .unwrap();
        // 2026-10-13 is a Tuesday.
        let tuesday = NaiveDate::from_ymd_opt(2026, 10, 13)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let next = engine.next_run_after(&task, tuesday).unwrap();
        assert_eq!(next.to_string(), "2026-10-19 09:00:00");

        let disabled = engine.toggle_enabled(&task.id).unwrap();
        assert!(engine.next_run_after(&disabled, tuesday).is_none());
    }

    #[tokio::test]
    async fn manual_firing_reports_through_subscription() {
        let (engine, db) = engine_with(vec![FakeRun::Exit(0, "ok\n")]);
        let task = engine
            .create_task(NewTask::new("x", "/opt/x").with_schedule(monday_at(9, 0)))
            .unwrap();
        let mut reports = engine.subscribe();

        engine.run_now(&task.id).await.unwrap();
        assert_eq!(engine.dispatch_once().await, 1);
        let report = reports.recv().await.unwrap();
        assert_eq!(report.task_id, task.id);
        assert_eq!(report.trigger, RunTrigger::Manual);

        engine.wait_idle().await;
        let runs = db.runs().list_runs_for_task(&task.id, 5).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].trigger, RunTrigger::Manual);
    }

    #[tokio::test]
    async fn stop_all_finalizes_running_firings() {
        let (engine, db) = engine_with(vec![FakeRun::Hang("")]);
        let task = engine
            .create_task(NewTask::new("x", "/opt/x").with_schedule(monday_at(9, 0)))
            .unwrap();
        engine.run_now(&task.id).await.unwrap();
        engine.dispatch_once().await;
        // Let the worker open its run row.
        while db.runs().list_runs_for_task(&task.id, 1).unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        assert_eq!(engine.stop_all().await, 1);
        let run = &db.runs().list_runs_for_task(&task.id, 1).unwrap()[0];
        assert_eq!(run.outcome, Some(taskwarden_store::RunOutcome::Cancelled));
    }

    /// A second engine over the same database, standing in for a CLI process.
    fn client_of(db: &Database) -> Arc<Engine> {
        Engine::new(
            db.clone(),
            &TaskwardenConfig::default(),
            Arc::new(FakeSpawner::default()),
            Arc::new(RecordingNotifier::default()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn only_one_engine_holds_the_lease() {
        let (serving, db) = engine_with(vec![]);
        let client = client_of(&db);
        assert!(serving.acquire_lease().unwrap());
        assert!(!client.acquire_lease().unwrap());
        assert_eq!(client.lease_holder().unwrap().unwrap().owner, serving.owner());

        assert!(serving.release_lease().unwrap());
        assert!(client.acquire_lease().unwrap());
    }

    #[tokio::test]
    async fn forwarded_run_is_answered_with_its_result() {
        let (serving, db) = engine_with(vec![FakeRun::Exit(4, "bad\n")]);
        let task = serving
            .create_task(NewTask::new("x", "/opt/x").with_schedule(monday_at(9, 0)))
            .unwrap();
        let client = client_of(&db);

        let request = client.request_run(&task.id).unwrap();
        assert_eq!(client.request(request).unwrap().state, RequestState::Pending);

        assert_eq!(serving.drain_requests().await.unwrap(), 1);
        assert_eq!(client.request(request).unwrap().state, RequestState::Queued);
        assert_eq!(serving.status().await.pending[0].trigger, RunTrigger::Manual);

        serving.dispatch_once().await;
        serving.wait_idle().await;
        let answered = client.request(request).unwrap();
        assert_eq!(answered.state, RequestState::Done);
        assert_eq!(answered.firing_status.as_deref(), Some("failed"));
        assert_eq!(answered.exit_code, Some(4));
    }

    #[tokio::test]
    async fn forwarded_requests_share_the_queue_rules() {
        let (serving, db) = engine_with(vec![]);
        let task = serving
            .create_task(NewTask::new("x", "/opt/x").with_schedule(monday_at(9, 0)))
            .unwrap();
        let client = client_of(&db);

        let first = client.request_run(&task.id).unwrap();
        let duplicate = client.request_run(&task.id).unwrap();
        let stop = client.request_stop(&task.id).unwrap();
        assert_eq!(serving.drain_requests().await.unwrap(), 3);

        assert_eq!(client.request(duplicate).unwrap().state, RequestState::AlreadyPending);
        assert_eq!(client.request(stop).unwrap().state, RequestState::Stopped);
        // Dequeued before it ran: the waiting run request learns it was cancelled.
        let first = client.request(first).unwrap();
        assert_eq!(first.state, RequestState::Done);
        assert_eq!(first.firing_status.as_deref(), Some("cancelled"));
        assert!(serving.status().await.pending.is_empty());

        let idle_stop = client.request_stop(&task.id).unwrap();
        serving.drain_requests().await.unwrap();
        assert_eq!(client.request(idle_stop).unwrap().state, RequestState::NotActive);
    }

    #[tokio::test]
    async fn limit_written_elsewhere_is_applied() {
        let (serving, db) = engine_with(vec![]);
        assert_eq!(serving.status().await.limit, 3);
        client_of(&db).set_concurrency_limit(1).await.unwrap();
        assert_eq!(serving.status().await.limit, 3);

        assert_eq!(serving.sync_limit().await.unwrap().get(), 1);
        assert_eq!(serving.status().await.limit, 1);
    }

    #[tokio::test]
    async fn takeover_closes_unanswered_requests() {
        let (engine, db) = engine_with(vec![]);
        let task = engine
            .create_task(NewTask::new("x", "/opt/x").with_schedule(monday_at(9, 0)))
            .unwrap();
        let request = engine.request_run(&task.id).unwrap();
        engine.recover_abandoned().unwrap();
        assert_eq!(
            db.requests().get(request).unwrap().state,
            RequestState::Abandoned
        );
        assert_eq!(engine.drain_requests().await.unwrap(), 0);
    }
}
