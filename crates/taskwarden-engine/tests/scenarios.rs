//! End-to-end behaviour of the engine with scripted processes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use tokio::sync::watch;

use taskwarden_core::TaskwardenConfig;
use taskwarden_engine::testing::{FakeRun, FakeSpawner, RecordingNotifier};
use taskwarden_engine::{Engine, FiringStatus};
use taskwarden_store::{
    exit_code, Database, DayOfWeek, NewTask, RequestState, RunOutcome, RunTrigger, TimeOfDay,
    WeeklySchedule,
};

struct Fixture {
    engine: Arc<Engine>,
    db: Database,
    spawner: Arc<FakeSpawner>,
    notifier: Arc<RecordingNotifier>,
}

fn fixture(runs: Vec<FakeRun>, limit: i64) -> Fixture {
    let db = Database::open_in_memory().unwrap();
    db.settings().set_concurrency_limit(limit).unwrap();
    let spawner = Arc::new(FakeSpawner::new(runs));
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = Engine::new(
        db.clone(),
        &TaskwardenConfig::default(),
        spawner.clone(),
        notifier.clone(),
    )
    .unwrap();
    Fixture {
        engine,
        db,
        spawner,
        notifier,
    }
}

// 2026-10-12 is a Monday.
fn monday(h: u32, m: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 10, 12)
        .unwrap()
        .and_hms_opt(h, m, s)
        .unwrap()
}

fn monday_nine() -> WeeklySchedule {
    WeeklySchedule::new().at(DayOfWeek::MONDAY, TimeOfDay::new(9, 0).unwrap())
}

/// Monday 09:00 trigger, one retry after a minute: the first attempt exits
/// 1, the second 0 a minute later. Two rows, one success notification.
#[tokio::test(start_paused = true)]
async fn scheduled_retry_then_success() {
    let f = fixture(vec![FakeRun::Exit(1, "first\n"), FakeRun::Exit(0, "second\n")], 1);
    let mut spec = NewTask::new("weekly-report", "/opt/jobs/weekly-report")
        .with_schedule(monday_nine())
        .with_retries(1, 1);
    spec.notify_on_success = true;
    let task = f.engine.create_task(spec).unwrap();

    let mut scheduler = f.engine.scheduler();
    assert_eq!(scheduler.tick_at(monday(9, 0, 7)).await, [task.id.clone()]);
    assert_eq!(f.engine.dispatch_once().await, 1);
    f.engine.wait_idle().await;

    let mut runs = f.db.runs().list_runs_for_task(&task.id, 10).unwrap();
    runs.sort_by_key(|r| r.attempt);
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].exit_code, Some(1));
    assert_eq!(runs[0].outcome, Some(RunOutcome::FailedRetrying));
    assert_eq!(runs[0].log_output.as_deref(), Some("first\n"));
    assert_eq!(runs[1].exit_code, Some(0));
    assert_eq!(runs[1].outcome, Some(RunOutcome::Succeeded));
    assert!(runs.iter().all(|r| r.trigger == RunTrigger::Scheduled));
    assert_eq!(f.notifier.titles(), ["Success: weekly-report"]);

    let spawned_at = f.spawner.spawn_times();
    assert_eq!(spawned_at.len(), 2);
    let gap = spawned_at[1] - spawned_at[0];
    assert!(
        gap >= Duration::from_secs(60) && gap < Duration::from_secs(61),
        "retry started {gap:?} after the first attempt"
    );

    // The same minute never fires twice.
    assert!(scheduler.tick_at(monday(9, 0, 52)).await.is_empty());
}

/// Two tasks due in the same minute with a limit of one: the second starts
/// only after the first's whole attempt sequence is over.
#[tokio::test(start_paused = true)]
async fn same_minute_tasks_run_fifo_under_limit_one() {
    let f = fixture(
        vec![
            FakeRun::Exit(1, ""),
            FakeRun::Exit(0, ""),
            FakeRun::Exit(0, ""),
        ],
        1,
    );
    let a = f
        .engine
        .create_task(
            NewTask::new("a", "/opt/jobs/a")
                .with_id("a")
                .with_schedule(monday_nine())
                .with_retries(1, 1),
        )
        .unwrap();
    let b = f
        .engine
        .create_task(
            NewTask::new("b", "/opt/jobs/b")
                .with_id("b")
                .with_schedule(monday_nine()),
        )
        .unwrap();

    let mut scheduler = f.engine.scheduler();
    scheduler.tick_at(monday(9, 0, 0)).await;
    assert_eq!(f.engine.dispatch_once().await, 1);
    let status = f.engine.status().await;
    assert_eq!(status.running.len(), 1);
    assert_eq!(status.running[0].task_id, a.id);
    assert_eq!(status.pending[0].task_id, b.id);

    // Drive the dispatcher the way the engine loop does until idle.
    let engine = f.engine.clone();
    let pump = tokio::spawn(async move {
        loop {
            engine.dispatch_once().await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
    f.engine.wait_idle().await;
    pump.abort();

    let programs: Vec<String> = f.spawner.spawned().into_iter().map(|c| c.program).collect();
    assert_eq!(programs, ["/opt/jobs/a", "/opt/jobs/a", "/opt/jobs/b"]);
    assert_eq!(f.db.runs().list_runs_for_task(&a.id, 10).unwrap().len(), 2);
    assert_eq!(f.db.runs().list_runs_for_task(&b.id, 10).unwrap().len(), 1);
}

/// Retries exhausted: retry_count + 1 rows, the last one terminal, only a
/// failure notification.
#[tokio::test(start_paused = true)]
async fn exhausted_retries_leave_task_enabled() {
    let f = fixture(vec![FakeRun::Exit(2, ""); 3], 3);
    let mut spec = NewTask::new("flaky", "/opt/jobs/flaky")
        .with_schedule(monday_nine())
        .with_retries(2, 5);
    spec.notify_on_success = true;
    let task = f.engine.create_task(spec).unwrap();

    let mut reports = f.engine.subscribe();
    f.engine.run_now(&task.id).await.unwrap();
    f.engine.dispatch_once().await;
    let report = reports.recv().await.unwrap();
    assert_eq!(report.status, FiringStatus::Failed);
    assert_eq!(report.attempts.len(), 3);

    let runs = f.db.runs().list_runs_for_task(&task.id, 10).unwrap();
    assert_eq!(runs.len(), 3);
    let terminal: Vec<_> = runs
        .iter()
        .filter(|r| r.outcome == Some(RunOutcome::FailedTerminal))
        .collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].attempt, 3);
    assert_eq!(f.notifier.titles(), ["Failed: flaky"]);
    assert!(f.engine.get_task(&task.id).unwrap().enabled);
}

/// Deleting a task removes its history.
#[tokio::test]
async fn delete_cascades_history() {
    let f = fixture(vec![FakeRun::Exit(0, "")], 3);
    let task = f
        .engine
        .create_task(NewTask::new("tmp", "/opt/jobs/tmp").with_schedule(monday_nine()))
        .unwrap();
    f.engine.run_now(&task.id).await.unwrap();
    f.engine.dispatch_once().await;
    f.engine.wait_idle().await;
    let run_id = f.db.runs().list_runs_for_task(&task.id, 1).unwrap()[0].id;

    f.engine.delete_task(&task.id).unwrap();
    assert!(f.engine.get_run(run_id).is_err());
    assert!(f.engine.list_runs_for_task(&task.id, 10).is_err());
}

/// Stopping a running task frees its slot at once; the next queued task is
/// admitted even though the stopped worker is still cleaning up.
#[tokio::test]
async fn stop_frees_slot_for_next_task() {
    let f = fixture(vec![FakeRun::Hang("partial\n"), FakeRun::Exit(0, "")], 1);
    let slow = f
        .engine
        .create_task(NewTask::new("slow", "/opt/jobs/slow").with_schedule(monday_nine()))
        .unwrap();
    let next = f
        .engine
        .create_task(NewTask::new("next", "/opt/jobs/next").with_schedule(monday_nine()))
        .unwrap();

    f.engine.run_now(&slow.id).await.unwrap();
    f.engine.run_now(&next.id).await.unwrap();
    assert_eq!(f.engine.dispatch_once().await, 1);
    assert_eq!(f.engine.dispatch_once().await, 0);

    f.engine.stop_task(&slow.id).await;
    assert_eq!(f.engine.dispatch_once().await, 1);
    f.engine.wait_idle().await;
    f.engine.stop_all().await;

    let slow_run = &f.db.runs().list_runs_for_task(&slow.id, 1).unwrap()[0];
    assert_eq!(slow_run.exit_code, Some(exit_code::CANCELLED));
    assert_eq!(slow_run.log_output.as_deref(), Some("partial\n"));
    let next_run = &f.db.runs().list_runs_for_task(&next.id, 1).unwrap()[0];
    assert_eq!(next_run.outcome, Some(RunOutcome::Succeeded));
}

/// With the loops running, every queued firing eventually finishes and the
/// concurrency limit is never exceeded.
#[tokio::test(start_paused = true)]
async fn engine_loop_drains_queue_within_limit() {
    let runs = (0..6).map(|_| FakeRun::Slow(0, Duration::from_secs(30))).collect();
    let f = fixture(runs, 2);
    let mut ids = Vec::new();
    for i in 0..6 {
        // Unscheduled, so the wall-clock scheduler loop never queues them.
        let mut spec = NewTask::new(format!("job-{i}"), format!("/opt/jobs/{i}"));
        spec.enabled = false;
        let task = f.engine.create_task(spec).unwrap();
        f.engine.run_now(&task.id).await.unwrap();
        ids.push(task.id);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_handle = tokio::spawn(f.engine.clone().run(shutdown_rx));

    let engine = f.engine.clone();
    let watcher = tokio::spawn(async move {
        let mut peak = 0;
        loop {
            let status = engine.status().await;
            peak = peak.max(status.running.len());
            if status.running.is_empty() && status.pending.is_empty() {
                return peak;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    });
    let peak = watcher.await.unwrap();
    f.engine.wait_idle().await;

    shutdown_tx.send(true).unwrap();
    loop_handle.await.unwrap();

    assert!(peak <= 2, "peak concurrency {peak}");
    assert_eq!(f.spawner.spawn_count(), 6);
    for id in ids {
        let runs = f.db.runs().list_runs_for_task(&id, 5).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, Some(RunOutcome::Succeeded));
    }
}

/// Lowering the limit below the number of running firings lets them finish
/// and admits nothing new until the count is under the new limit.
#[tokio::test(start_paused = true)]
async fn lowering_limit_does_not_preempt() {
    let runs = (0..3).map(|_| FakeRun::Slow(0, Duration::from_secs(60))).collect();
    let f = fixture(runs, 2);
    let mut ids = Vec::new();
    for i in 0..3 {
        let task = f
            .engine
            .create_task(
                NewTask::new(format!("t{i}"), format!("/opt/jobs/t{i}"))
                    .with_id(format!("t{i}"))
                    .with_schedule(monday_nine()),
            )
            .unwrap();
        f.engine.run_now(&task.id).await.unwrap();
        ids.push(task.id);
    }
    assert_eq!(f.engine.dispatch_once().await, 2);
    f.engine.set_concurrency_limit(1).await.unwrap();
    assert_eq!(f.engine.dispatch_once().await, 0);
    assert_eq!(f.engine.status().await.running.len(), 2);

    let engine = f.engine.clone();
    let pump = tokio::spawn(async move {
        let mut peak_once_drained = 0;
        loop {
            engine.dispatch_once().await;
            let status = engine.status().await;
            if status.pending.is_empty() {
                peak_once_drained = peak_once_drained.max(status.running.len());
            }
            if status.running.is_empty() && status.pending.is_empty() {
                return peak_once_drained;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
    let peak = pump.await.unwrap();
    assert_eq!(peak, 1);
    assert_eq!(f.spawner.spawn_count(), 3);
    let third = f.db.runs().list_runs_for_task(&ids[2], 1).unwrap();
    assert_eq!(third.len(), 1);
}

/// Two handles on one database file: one serving, one making edits the way a
/// separate CLI process would. Task edits, disabling and the limit all reach
/// the serving engine without going through it.
#[tokio::test(start_paused = true)]
async fn edits_from_another_process_reach_the_serving_engine() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taskwarden.db");
    let serving_db = Database::open(&path).unwrap();
    let editor = Database::open(&path).unwrap();

    let spawner = Arc::new(FakeSpawner::default());
    let serving = Engine::new(
        serving_db.clone(),
        &TaskwardenConfig::default(),
        spawner.clone(),
        Arc::new(RecordingNotifier::default()),
    )
    .unwrap();
    let mut scheduler = serving.scheduler();
    assert!(scheduler.tick_at(monday(8, 59, 0)).await.is_empty());

    let task = editor
        .tasks()
        .create_task(
            NewTask::new("added-later", "/opt/jobs/added-later").with_schedule(monday_nine()),
        )
        .unwrap();
    editor.settings().set_concurrency_limit(1).unwrap();

    assert_eq!(scheduler.tick_at(monday(9, 0, 0)).await, [task.id.clone()]);
    assert_eq!(serving.sync_limit().await.unwrap().get(), 1);
    assert_eq!(serving.status().await.limit, 1);

    // Disabled between queueing and admission: the firing is skipped.
    editor.tasks().set_enabled(&task.id, false).unwrap();
    let mut reports = serving.subscribe();
    assert_eq!(serving.dispatch_once().await, 1);
    let report = reports.recv().await.unwrap();
    assert_eq!(report.status, FiringStatus::Skipped);
    assert_eq!(spawner.spawn_count(), 0);
    assert!(serving_db.runs().list_runs_for_task(&task.id, 5).unwrap().is_empty());

    // And the next week it is not queued at all.
    let next_monday = monday(9, 0, 0) + chrono::Duration::weeks(1);
    assert!(scheduler.tick_at(next_monday).await.is_empty());
}

/// A run requested from another process waits in the serving engine's queue
/// behind what is already running, and learns the result when it is done.
#[tokio::test(start_paused = true)]
async fn forwarded_run_respects_the_serving_limit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taskwarden.db");
    let serving_db = Database::open(&path).unwrap();
    serving_db.settings().set_concurrency_limit(1).unwrap();
    let spawner = Arc::new(FakeSpawner::new([
        FakeRun::Slow(0, Duration::from_secs(120)),
        FakeRun::Exit(5, "nope\n"),
    ]));
    let serving = Engine::new(
        serving_db.clone(),
        &TaskwardenConfig::default(),
        spawner.clone(),
        Arc::new(RecordingNotifier::default()),
    )
    .unwrap();
    let client = Engine::new(
        Database::open(&path).unwrap(),
        &TaskwardenConfig::default(),
        Arc::new(FakeSpawner::default()),
        Arc::new(RecordingNotifier::default()),
    )
    .unwrap();

    let mut long = NewTask::new("long", "/opt/jobs/long");
    long.enabled = false;
    let long = serving.create_task(long).unwrap();
    let mut short = NewTask::new("short", "/opt/jobs/short");
    short.enabled = false;
    let short = serving.create_task(short).unwrap();

    assert!(serving.acquire_lease().unwrap());
    assert!(!client.acquire_lease().unwrap());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loops = tokio::spawn(serving.clone().run(shutdown_rx));

    serving.run_now(&long.id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(serving.status().await.running.len(), 1);

    let request = client.request_run(&short.id).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(client.request(request).unwrap().state, RequestState::Queued);
    assert_eq!(spawner.spawn_count(), 1, "limit of one was exceeded");

    let answered = loop {
        let current = client.request(request).unwrap();
        if !current.state.is_open() {
            break current;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    };
    assert_eq!(answered.state, RequestState::Done);
    assert_eq!(answered.firing_status.as_deref(), Some("failed"));
    assert_eq!(answered.exit_code, Some(5));
    assert_eq!(spawner.spawn_count(), 2);

    shutdown_tx.send(true).unwrap();
    loops.await.unwrap();
    assert!(client.lease_holder().unwrap().is_none());
}

#[cfg(unix)]
mod real_processes {
    use super::*;
    use std::io::Write;

    use taskwarden_engine::TokioSpawner;

    #[tokio::test]
    async fn shell_script_output_and_exit_code_are_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("job.sh");
        let mut file = std::fs::File::create(&script).unwrap();
        writeln!(file, "echo to-stdout").unwrap();
        writeln!(file, "echo to-stderr >&2").unwrap();
        writeln!(file, "exit 7").unwrap();
        drop(file);

        let db = Database::open_in_memory().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = Engine::new(
            db.clone(),
            &TaskwardenConfig::default(),
            Arc::new(TokioSpawner),
            notifier.clone(),
        )
        .unwrap();
        let task = engine
            .create_task(
                NewTask::new("shell", script.to_str().unwrap()).with_schedule(monday_nine()),
            )
            .unwrap();

        let mut reports = engine.subscribe();
        engine.run_now(&task.id).await.unwrap();
        engine.dispatch_once().await;
        let report = tokio::time::timeout(Duration::from_secs(10), reports.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.last_exit_code(), Some(7));

        let run = &db.runs().list_runs_for_task(&task.id, 1).unwrap()[0];
        let log = run.log_output.as_deref().unwrap();
        assert!(log.contains("to-stdout\n"));
        assert!(log.contains("to-stderr\n"));
        assert_eq!(notifier.titles(), ["Failed: shell"]);
    }

    #[tokio::test]
    async fn missing_script_is_a_spawn_failure() {
        let db = Database::open_in_memory().unwrap();
        let engine = Engine::new(
            db.clone(),
            &TaskwardenConfig::default(),
            Arc::new(TokioSpawner),
            Arc::new(RecordingNotifier::default()),
        )
        .unwrap();
        let task = engine
            .create_task(
                NewTask::new("ghost", "/nonexistent/dir/ghost.sh").with_schedule(monday_nine()),
            )
            .unwrap();
        let mut reports = engine.subscribe();
        engine.run_now(&task.id).await.unwrap();
        engine.dispatch_once().await;
        let report = reports.recv().await.unwrap();
        assert_eq!(report.last_exit_code(), Some(exit_code::SPAWN_FAILED));
    }
}
