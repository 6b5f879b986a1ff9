//! REPL – the operator shell.
//!
//! Supported slash-commands:
//!   /run <id|path> – start a routine from the routines dir or a JSON file
//!   /pause         – interrupt the current step and hold
//!   /resume        – continue a paused routine (the step runs again)
//!   /battery       – raise a low-battery abort by hand
//!   /cancel        – stop the routine without sitting down
//!   /step          – show the routine's current step
//!   /status        – show the latest robot telemetry
//!   /quit | /exit  – cancel any routine and exit

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use botflow_link::StatusCache;
use botflow_runtime::{
    ActionClient, BatteryMonitor, CURRENT_STEP_QUERY, DirectoryGraphStore, GraphStore,
    LocalScheduler, MoveSupervisor, RoutineInterpreter, SignalSender,
};
use botflow_types::{BotError, RoutineGraph, RunOutcome, RunReport, Signal, new_run_id};
use chrono::Utc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Config;

/// A parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run(String),
    Signal(Signal),
    Step,
    Status,
    Schema,
    Help,
    Quit,
    /// A command that needs an argument was given none.
    Usage(&'static str),
    Unknown(String),
}

pub fn parse_command(line: &str) -> Option<Command> {
    let mut parts = line.split_whitespace();
    let head = parts.next()?;
    let rest = parts.collect::<Vec<_>>().join(" ");
    let cmd = match head {
        "/run" if rest.is_empty() => Command::Usage("/run <routine-id | path/to/routine.json>"),
        "/run" => Command::Run(rest),
        "/pause" => Command::Signal(Signal::Pause),
        "/resume" => Command::Signal(Signal::Resume),
        "/battery" => Command::Signal(Signal::LowBattery),
        "/cancel" | "/stop" => Command::Signal(Signal::Cancel),
        "/step" => Command::Step,
        "/status" => Command::Status,
        "/schema" => Command::Schema,
        "/help" => Command::Help,
        "/quit" | "/exit" => Command::Quit,
        other => Command::Unknown(other.to_string()),
    };
    Some(cmd)
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

struct ActiveRun {
    run_id: String,
    signals: SignalSender,
    scheduler: Arc<LocalScheduler>,
    handle: JoinHandle<RunReport>,
}

fn locked(active: &Mutex<Option<ActiveRun>>) -> MutexGuard<'_, Option<ActiveRun>> {
    active.lock().unwrap_or_else(|e| e.into_inner())
}

/// Delivers signals to whichever routine is running.  Cheap to clone; the
/// Ctrl-C handler holds one.
#[derive(Clone)]
pub struct RunControl {
    active: Arc<Mutex<Option<ActiveRun>>>,
}

impl RunControl {
    /// Returns the id of the run the signal was delivered to.
    pub fn send(&self, signal: Signal) -> Result<String, String> {
        let active = locked(&self.active);
        match active.as_ref() {
            Some(run) if !run.handle.is_finished() => run
                .signals
                .send(signal)
                .map(|()| run.run_id.clone())
                .map_err(|e| e.to_string()),
            _ => Err("No routine is running.".to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        locked(&self.active)
            .as_ref()
            .is_some_and(|run| !run.handle.is_finished())
    }
}

/// Long-lived pieces shared by every routine started from the shell.
pub struct Session {
    runtime: Handle,
    config: Config,
    client: Arc<ActionClient>,
    mover: Arc<MoveSupervisor>,
    cache: Arc<StatusCache>,
    store: DirectoryGraphStore,
    shutdown: CancellationToken,
    control: RunControl,
}

impl Session {
    pub fn new(
        runtime: Handle,
        config: Config,
        client: Arc<ActionClient>,
        cache: Arc<StatusCache>,
        shutdown: CancellationToken,
    ) -> Self {
        let mover = Arc::new(MoveSupervisor::new(
            Arc::clone(&client),
            Some(Arc::clone(&cache)),
            config.mover(),
        ));
        let store = DirectoryGraphStore::new(config.routines_dir.clone());
        Self {
            runtime,
            config,
            client,
            mover,
            cache,
            store,
            shutdown,
            control: RunControl {
                active: Arc::new(Mutex::new(None)),
            },
        }
    }

    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    /// Cancel a running routine and wait briefly for its report.
    pub fn finish(&self) {
        let Some(run) = locked(&self.control.active).take() else {
            return;
        };
        if run.handle.is_finished() {
            return;
        }
        let _ = run.signals.send(Signal::Cancel);
        let wait = Duration::from_secs(self.config.stop_timeout_secs + 1);
        if self
            .runtime
            .block_on(tokio::time::timeout(wait, run.handle))
            .is_err()
        {
            warn!(run_id = %run.run_id, "routine did not stop in time");
        }
    }

    fn load_graph(&self, target: &str) -> Result<RoutineGraph, BotError> {
        let path = Path::new(target);
        if target.ends_with(".json") || path.is_file() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| BotError::InvalidInput(format!("{}: {e}", path.display())))?;
            RoutineGraph::from_json(&raw)
        } else {
            self.runtime.block_on(self.store.get_graph(target))
        }
    }

    fn start(&self, target: &str) {
        if self.control.is_running() {
            println!(
                "{} a routine is already running; {} it first.",
                "Busy:".yellow(),
                "/cancel".bold()
            );
            return;
        }
        let graph = match self.load_graph(target) {
            Ok(graph) => graph,
            Err(e) => {
                println!("{}: {}", "Cannot load routine".red(), e);
                return;
            }
        };
        for (from, to) in graph.dangling_transitions() {
            println!(
                "  {} node {} points to missing node {}",
                "Warning:".yellow(),
                from.bold(),
                to.bold()
            );
        }

        let (scheduler, signals) = LocalScheduler::new();
        let scheduler = Arc::new(scheduler);
        let interpreter = RoutineInterpreter::new(
            scheduler.clone(),
            Arc::clone(&self.client),
            Arc::clone(&self.mover),
            self.config.interpreter(),
        );

        let monitor_stop = self.shutdown.child_token();
        let monitor = BatteryMonitor::new(
            Arc::clone(&self.cache),
            signals.clone(),
            self.config.battery_monitor(),
        );
        self.runtime.spawn(monitor.run(monitor_stop.clone()));

        let run_id = new_run_id();
        let id = run_id.clone();
        let handle = self.runtime.spawn(async move {
            let report = interpreter.run(&graph, &id).await;
            monitor_stop.cancel();
            print_report(&report);
            report
        });

        println!("  {} {}", "▶ Started".green().bold(), run_id.dimmed());
        *locked(&self.control.active) = Some(ActiveRun {
            run_id,
            signals,
            scheduler,
            handle,
        });
    }

    fn signal(&self, signal: Signal) {
        match self.control.send(signal) {
            Ok(run_id) => println!("  {} {} → {}", "✓".green(), signal, run_id.dimmed()),
            Err(e) => println!("  {}", e.yellow()),
        }
    }

    fn step(&self) {
        let active = locked(&self.control.active);
        let Some(run) = active.as_ref() else {
            println!("  {}", "No routine has been started.".yellow());
            return;
        };
        let label = run
            .scheduler
            .query(CURRENT_STEP_QUERY)
            .unwrap_or_else(|| "unknown".to_string());
        let state = if run.handle.is_finished() { "finished" } else { "running" };
        println!("  {} {} ({})", "Current step:".bold(), label.cyan(), state);
        for stalled in run.scheduler.stalled_steps() {
            println!("  {} {}", "⚠".yellow(), stalled);
        }
    }

    fn status(&self) {
        let status = match self.cache.get() {
            Ok(status) => status,
            Err(BotError::StatusStale { last_known, age_ms }) => {
                println!("  {} last update {} ms ago", "Telemetry is stale:".yellow(), age_ms);
                *last_known
            }
            Err(e) => {
                println!("  {} {}", "No telemetry:".yellow(), e);
                return;
            }
        };
        let age = (Utc::now() - status.observed_at).num_milliseconds();
        println!("{}", "Robot Status".bold().underline());
        println!("  Device   : {}", status.device_name.bold());
        println!("  Battery  : {}%", status.battery_level);
        println!(
            "  Position : ({:.2}, {:.2})  heading {:.0}°",
            status.position.x,
            status.position.y,
            status.orientation.yaw_degrees()
        );
        println!(
            "  Mission  : {} {:?} {}",
            status.mission_id.dimmed(),
            status.mission_code,
            status.mission_message
        );
        println!("  Observed : {} ms ago", age);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loop
// ─────────────────────────────────────────────────────────────────────────────

/// Read commands until `/quit`, EOF or `shutdown` is set.
pub fn run(session: &Session, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "botflow>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let Some(command) = parse_command(&line) else {
            continue;
        };
        match command {
            Command::Run(target) => session.start(&target),
            Command::Signal(signal) => session.signal(signal),
            Command::Step => session.step(),
            Command::Status => session.status(),
            Command::Schema => match schema_text() {
                Ok(text) => println!("{text}"),
                Err(e) => println!("{}: {}", "Schema error".red(), e),
            },
            Command::Help => cmd_help(),
            Command::Quit => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Command::Usage(usage) => println!("  {} {}", "Usage:".yellow(), usage),
            Command::Unknown(other) => println!(
                "{} '{}'. Type {} for available commands.",
                "Unknown command:".red(),
                other.yellow(),
                "/help".bold()
            ),
        }
    }
}

fn cmd_help() {
    println!();
    println!("{}", "botflow Commands".bold().underline());
    println!("  {}  – start a routine", "/run <id|file>".bold().cyan());
    println!("  {}          – interrupt the step and hold", "/pause".bold().cyan());
    println!("  {}         – continue; the step runs again", "/resume".bold().cyan());
    println!("  {}        – abort and sit the robot down", "/battery".bold().cyan());
    println!("  {}         – abort without sitting down", "/cancel".bold().cyan());
    println!("  {}           – show the current step", "/step".bold().cyan());
    println!("  {}         – show robot telemetry", "/status".bold().cyan());
    println!("  {}         – print the routine file JSON Schema", "/schema".bold().cyan());
    println!("  {}    – exit", "/quit  /exit".bold().cyan());
    println!();
}

/// Pretty JSON Schema of a routine file.
fn schema_text() -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&botflow_types::routine_schema())
}

fn print_report(report: &RunReport) {
    println!();
    let outcome = match report.outcome {
        RunOutcome::Completed => report.outcome.to_string().green().bold(),
        RunOutcome::Failed => report.outcome.to_string().red().bold(),
        RunOutcome::Canceled => report.outcome.to_string().yellow().bold(),
    };
    println!("  {} {} – {}", outcome, report.run_id.dimmed(), report.message);
    if let Some(e) = &report.compensation_error {
        println!("  {} {}", "Compensation failed:".red(), e);
    }
}
