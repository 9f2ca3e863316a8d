use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{info, warn};

use taskwarden_engine::{EnqueueOutcome, Engine, FiringReport, FiringStatus};
use taskwarden_store::{
    NewTask, RequestState, RunRecord, RunRequest, Task, TaskPatch, WeeklySchedule,
};

use crate::cli::{AddArgs, Cli, Command, TaskCommand, UpdateArgs};

/// How often a forwarded request is checked for an answer.
const REQUEST_POLL: Duration = Duration::from_millis(250);
/// How long `stop` waits for the serving process to pick its request up.
const STOP_WAIT: Duration = Duration::from_secs(10);

pub async fn execute(cli: Cli, engine: Arc<Engine>) -> anyhow::Result<ExitCode> {
    let json = cli.json;
    match cli.command {
        Command::Serve => serve(engine).await?,
        Command::Task(cmd) => task(&engine, cmd, json)?,
        Command::Run { id } => return run(engine, &id, json).await,
        Command::Stop { id } => stop(&engine, &id).await?,
        Command::History { id, limit } => {
            let runs = engine.list_runs_for_task(&id, limit)?;
            if json {
                print_json(&runs)?;
            } else {
                print_runs(&runs);
            }
        }
        Command::Log { run_id } => match engine.get_run_log(run_id)? {
            Some(log) => print!("{log}"),
            None => eprintln!("run {run_id} has no output"),
        },
        Command::Stats { hours, top } => {
            let stats = engine.aggregate_stats(hours, top)?;
            if json {
                print_json(&stats)?;
            } else {
                println!(
                    "last {}h: {} succeeded, {} failed",
                    stats.window_hours, stats.counts.succeeded, stats.counts.failed
                );
                for (code, count) in &stats.counts.by_exit_code {
                    println!("  exit {code:>4}: {count}");
                }
                println!("runs by hour:");
                for (hour, count) in stats.hourly.iter().enumerate().filter(|(_, c)| **c > 0) {
                    println!("  {hour:02}:00  {count}");
                }
                if !stats.slowest.is_empty() {
                    println!("slowest tasks:");
                    for t in &stats.slowest {
                        println!("  {:<24} {:>8.1}s avg over {} runs", t.name, t.avg_duration_secs, t.runs);
                    }
                }
            }
        }
        Command::Concurrency { value } => {
            let limit = match value {
                Some(v) => engine.set_concurrency_limit(v).await?,
                None => engine.concurrency_limit()?,
            };
            if json {
                print_json(&serde_json::json!({ "max_concurrent_runs": limit }))?;
            } else {
                println!("{limit}");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn serve(engine: Arc<Engine>) -> anyhow::Result<()> {
    if !engine.acquire_lease()? {
        let holder = engine.lease_holder()?.map(|h| h.owner).unwrap_or_default();
        bail!("database is already being served by process {holder}");
    }
    engine.recover_abandoned()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loops = tokio::spawn(Arc::clone(&engine).run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutdown requested");

    // signal loops to stop, then let in-flight runs record as cancelled
    let _ = shutdown_tx.send(true);
    if let Err(e) = loops.await {
        warn!(error = %e, "engine loop ended abnormally");
    }
    engine.stop_all().await;
    Ok(())
}

/// One manual firing through the admission queue. If no other process is
/// serving the database this one takes the lease and runs it; otherwise the
/// serving process gets a request and this one waits for the answer.
async fn run(engine: Arc<Engine>, id: &str, json: bool) -> anyhow::Result<ExitCode> {
    let task_id = engine.get_task(id)?.id;
    if engine.acquire_lease()? {
        run_here(engine, &task_id, json).await
    } else {
        run_forwarded(&engine, &task_id, json).await
    }
}

async fn run_here(engine: Arc<Engine>, task_id: &str, json: bool) -> anyhow::Result<ExitCode> {
    engine.recover_abandoned()?;
    let mut reports = engine.subscribe();
    if let other @ (EnqueueOutcome::AlreadyPending | EnqueueOutcome::AlreadyRunning) =
        engine.run_now(task_id).await?
    {
        let _ = engine.release_lease();
        bail!("task {task_id} not queued: {other:?}");
    }

    // Requests forwarded by other processes are served while we hold the lease.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let queue = tokio::spawn(Arc::clone(&engine).serve_queue(shutdown_rx));

    let waited: anyhow::Result<FiringReport> = async {
        loop {
            tokio::select! {
                received = reports.recv() => match received {
                    Ok(report) if report.task_id == task_id => return Ok(report),
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "missed firing reports"),
                    Err(RecvError::Closed) => bail!("engine stopped before {task_id} finished"),
                },
                _ = tokio::signal::ctrl_c() => {
                    info!(task_id, "stopping");
                    engine.stop_task(task_id).await;
                }
            }
        }
    }
    .await;

    let status = engine.status().await;
    if !status.pending.is_empty() || !status.running.is_empty() {
        info!("waiting for forwarded firings before releasing the database");
        tokio::select! {
            _ = engine.wait_idle() => {}
            _ = tokio::signal::ctrl_c() => {
                engine.stop_all().await;
            }
        }
    }
    let _ = shutdown_tx.send(true);
    if let Err(e) = queue.await {
        warn!(error = %e, "queue loop ended abnormally");
    }

    let report = waited?;
    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    Ok(exit_status(report.status, report.last_exit_code()))
}

async fn run_forwarded(engine: &Engine, task_id: &str, json: bool) -> anyhow::Result<ExitCode> {
    let request_id = engine.request_run(task_id)?;
    info!(task_id, request_id, "handed to the serving process");

    let mut poll = tokio::time::interval(REQUEST_POLL);
    let mut stop_sent = false;
    let request = loop {
        tokio::select! {
            _ = poll.tick() => {}
            _ = tokio::signal::ctrl_c(), if !stop_sent => {
                info!(task_id, "stopping");
                engine.request_stop(task_id)?;
                stop_sent = true;
                continue;
            }
        }
        let request = engine.request(request_id)?;
        if !request.state.is_open() {
            break request;
        }
        if engine.lease_holder()?.is_none() {
            bail!("serving process went away before {task_id} finished");
        }
    };

    let status = forwarded_status(&request)?;
    if json {
        print_json(&request)?;
    } else {
        match request.exit_code {
            Some(code) => println!("{task_id}: {status} (exit {code})"),
            None => println!("{task_id}: {status}"),
        }
    }
    Ok(exit_status(status, request.exit_code))
}

/// Firing status of an answered run request.
fn forwarded_status(request: &RunRequest) -> anyhow::Result<FiringStatus> {
    let task_id = &request.task_id;
    match request.state {
        RequestState::Done => Ok(request
            .firing_status
            .as_deref()
            .unwrap_or(FiringStatus::Abandoned.as_str())
            .parse()?),
        RequestState::AlreadyPending | RequestState::AlreadyRunning => {
            bail!("task {task_id} not queued: {}", request.state)
        }
        other => bail!("run request for {task_id} ended as {other}"),
    }
}

/// Ask the serving process to stop a firing and wait for its answer.
async fn stop(engine: &Engine, id: &str) -> anyhow::Result<()> {
    let task_id = engine.get_task(id)?.id;
    if engine.lease_holder()?.is_none() {
        println!("{task_id}: not running (no process is serving the database)");
        return Ok(());
    }
    let request_id = engine.request_stop(&task_id)?;
    let answered = tokio::time::timeout(STOP_WAIT, wait_answered(engine, request_id))
        .await
        .context("serving process did not answer the stop request")??;
    match answered {
        RequestState::Stopped => println!("{task_id}: stopped"),
        RequestState::NotActive => println!("{task_id}: not running"),
        other => bail!("stop request for {task_id} ended as {other}"),
    }
    Ok(())
}

async fn wait_answered(engine: &Engine, request_id: i64) -> anyhow::Result<RequestState> {
    loop {
        tokio::time::sleep(REQUEST_POLL).await;
        let request = engine.request(request_id)?;
        if !request.state.is_open() {
            return Ok(request.state);
        }
    }
}

fn exit_status(status: FiringStatus, last_exit_code: Option<i32>) -> ExitCode {
    match status {
        FiringStatus::Succeeded => ExitCode::SUCCESS,
        FiringStatus::Failed => match last_exit_code {
            Some(code @ 1..=255) => ExitCode::from(code as u8),
            _ => ExitCode::FAILURE,
        },
        FiringStatus::Cancelled => ExitCode::from(130),
        FiringStatus::Skipped | FiringStatus::Abandoned => ExitCode::FAILURE,
    }
}

fn task(engine: &Engine, cmd: TaskCommand, json: bool) -> anyhow::Result<()> {
    match cmd {
        TaskCommand::List => {
            let tasks = engine.list_tasks()?;
            if json {
                print_json(&tasks)?;
            } else if tasks.is_empty() {
                println!("no tasks");
            } else {
                for t in &tasks {
                    let next = engine
                        .next_run(t)
                        .map(|at| at.format("%a %Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<36}  {:<20}  {:<3}  next {}",
                        t.id,
                        t.name,
                        if t.enabled { "on" } else { "off" },
                        next
                    );
                }
            }
        }
        TaskCommand::Show { id } => {
            let t = engine.get_task(&id)?;
            if json {
                print_json(&t)?;
            } else {
                print_task(engine, &t);
            }
        }
        TaskCommand::Add(args) => {
            let t = engine.create_task(new_task(args)?)?;
            info!(task_id = %t.id, "task created");
            if json {
                print_json(&t)?;
            } else {
                println!("{}", t.id);
            }
        }
        TaskCommand::Update(args) => {
            let id = args.id.clone();
            let patch = patch(args)?;
            if patch.is_empty() {
                bail!("nothing to update");
            }
            let t = engine.update_task(&id, patch)?;
            if json {
                print_json(&t)?;
            } else {
                print_task(engine, &t);
            }
        }
        TaskCommand::Remove { id } => {
            engine.delete_task(&id)?;
            println!("removed {id}");
        }
        TaskCommand::Toggle { id } => {
            let t = engine.toggle_enabled(&id)?;
            println!("{} {}", t.id, if t.enabled { "enabled" } else { "disabled" });
        }
    }
    Ok(())
}

fn parse_schedule(entries: &[String]) -> anyhow::Result<WeeklySchedule> {
    let mut schedule = WeeklySchedule::new();
    for entry in entries {
        schedule.add_entry(entry)?;
    }
    Ok(schedule)
}

fn new_task(args: AddArgs) -> anyhow::Result<NewTask> {
    let mut spec = NewTask::new(args.name, args.script)
        .with_schedule(parse_schedule(&args.at)?)
        .with_retries(args.retries, args.retry_delay);
    spec.id = args.id;
    spec.enabled = !args.disabled;
    spec.notify_on_success = args.notify_success;
    spec.notify_on_failure = !args.no_notify_failure;
    Ok(spec)
}

fn patch(args: UpdateArgs) -> anyhow::Result<TaskPatch> {
    let schedule = if args.clear_schedule {
        Some(WeeklySchedule::new())
    } else if args.at.is_empty() {
        None
    } else {
        Some(parse_schedule(&args.at)?)
    };
    Ok(TaskPatch {
        name: args.name,
        script_path: args.script,
        schedule,
        enabled: args.enabled,
        retry_count: args.retries,
        retry_delay_minutes: args.retry_delay,
        notify_on_success: args.notify_success,
        notify_on_failure: args.notify_failure,
    })
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_task(engine: &Engine, t: &Task) {
    println!("id:        {}", t.id);
    println!("name:      {}", t.name);
    println!("script:    {}", t.script_path);
    println!("schedule:  {}", t.schedule.describe());
    println!("enabled:   {}", t.enabled);
    println!(
        "retries:   {} (every {} min)",
        t.retry_count, t.retry_delay_minutes
    );
    println!(
        "notify:    success={} failure={}",
        t.notify_on_success, t.notify_on_failure
    );
    if let Some(next) = engine.next_run(t) {
        println!("next run:  {}", next.format("%a %Y-%m-%d %H:%M"));
    }
}

fn print_runs(runs: &[RunRecord]) {
    if runs.is_empty() {
        println!("no runs");
        return;
    }
    for r in runs {
        let exit = r
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        let duration = r
            .duration_seconds
            .map(|d| format!("{d:.1}s"))
            .unwrap_or_else(|| "-".to_string());
        let outcome = r
            .outcome
            .map(|o| o.as_str())
            .unwrap_or("running");
        println!(
            "#{:<6} {}  attempt {}  {:<9} exit {:>4}  {:>8}  {}",
            r.id, r.start_time, r.attempt, r.trigger.as_str(), exit, duration, outcome
        );
    }
}

fn print_report(report: &FiringReport) {
    for a in &report.attempts {
        match &a.spawn_error {
            Some(failure) => println!(
                "attempt {}: could not start {}: {} (run #{})",
                a.attempt, failure.program, failure.reason, a.run_id
            ),
            None => println!(
                "attempt {}: exit {} {} (run #{})",
                a.attempt, a.exit_code, a.outcome, a.run_id
            ),
        }
    }
    println!("{}: {:?}", report.task_id, report.status);
}
