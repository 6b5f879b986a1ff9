//! `botflow` – operator shell for robot routines.
//!
//! 1. Loads `~/.botflow/config.toml`, running a first-run wizard when absent.
//! 2. Starts the telemetry subscriber that keeps the status cache warm.
//! 3. Drops the operator into a REPL that starts routines and delivers
//!    pause/resume/low-battery/cancel signals.
//! 4. Ctrl-C cancels the running routine and exits.

mod config;
mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use botflow_link::{DeviceLink, StatusCache, StatusSubscriber, WsDialer};
use botflow_runtime::ActionClient;
use botflow_types::Signal;

fn main() {
    // Before the runtime exists; the OTLP exporter is synchronous.
    let _tracing = botflow_runtime::init_tracing("botflow");

    print_banner();

    let cfg = match config::load() {
        Ok(None) => run_first_run_wizard(),
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let cache = Arc::new(StatusCache::new(cfg.status_freshness()));
    let subscriber = StatusSubscriber::new(Arc::new(WsDialer), Arc::clone(&cache), cfg.subscriber());
    let subscriber_task = {
        let _enter = runtime.enter();
        subscriber.spawn(shutdown.clone())
    };

    let link = Arc::new(DeviceLink::default());
    let client = Arc::new(ActionClient::new(Arc::clone(&link), cfg.action_client()));

    println!("  Robot endpoint {}", cfg.endpoint().bold());
    println!("  Routines in {}", cfg.routines_dir.display().to_string().bold());
    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    let session = repl::Session::new(
        runtime.handle().clone(),
        cfg,
        client,
        cache,
        shutdown.clone(),
    );

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let exit_flag = Arc::new(AtomicBool::new(false));
    {
        let exit_flag = Arc::clone(&exit_flag);
        let control = session.control();
        if let Err(e) = ctrlc::set_handler(move || {
            println!();
            println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
            match control.send(Signal::Cancel) {
                Ok(run_id) => println!("  ✓ Cancel sent to {}", run_id),
                Err(_) => println!("  ✓ No routine running."),
            }
            exit_flag.store(true, Ordering::SeqCst);
        }) {
            warn!(error = %e, "failed to install Ctrl-C handler");
        }
    }

    repl::run(&session, exit_flag);

    session.finish();
    shutdown.cancel();
    runtime.block_on(async {
        let _ = tokio::time::timeout(Duration::from_secs(1), subscriber_task).await;
        link.close_all().await;
    });
    runtime.shutdown_timeout(Duration::from_secs(1));
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║       botflow First-Run Wizard       ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's point botflow at a robot.\n");

    let mut cfg = config::Config::default();
    config::apply_env_overrides(&mut cfg);

    cfg.robot_host = prompt_line(
        &format!("  Robot host or IP [{}]: ", cfg.robot_host),
        &cfg.robot_host,
    );

    let port = prompt_line(
        &format!("  Robot bridge port [{}]: ", cfg.robot_port),
        &cfg.robot_port.to_string(),
    );
    if let Ok(p) = port.parse::<u16>() {
        cfg.robot_port = p;
    }

    let threshold = prompt_line(
        &format!("  Low battery threshold, 0 to disable [{}]: ", cfg.low_battery_threshold),
        &cfg.low_battery_threshold.to_string(),
    );
    match threshold.parse::<i64>() {
        Ok(level) if (0..=100).contains(&level) => cfg.low_battery_threshold = level,
        _ => println!(
            "  {} keeping {}%",
            "Not a percentage,".yellow(),
            cfg.low_battery_threshold
        ),
    }

    let dir = prompt_line(
        &format!("  Routines directory [{}]: ", cfg.routines_dir.display()),
        &cfg.routines_dir.display().to_string(),
    );
    cfg.routines_dir = dir.into();

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

fn print_banner() {
    println!();
    println!("{}", r#"   __          __  ______              "#.bold().cyan());
    println!("{}", r#"  / /_  ____  / /_/ __/ /___ _      __"#.bold().cyan());
    println!("{}", r#" / __ \/ __ \/ __/ /_/ / __ \ | /| / /"#.bold().cyan());
    println!("{}", r#"/_.___/\____/\__/_/ /_/\____/__/|__/ "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "botflow".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Robot routine runner");
    println!();
}

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
