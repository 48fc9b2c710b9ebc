//! multiserve - Supervise multiple model-server instances on one host
//!
//! Every command opens the same state database and lock directory, so
//! commands issued from different shells and the background daemon all
//! serialize through the per-instance locks.
//!
//! # Usage
//!
//! ```bash
//! multiserve start llama-7b
//! multiserve status
//! multiserve reconcile --orphans
//! RUST_LOG=multiserve=debug multiserve daemon
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use single_instance::SingleInstance;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use multiserve::core::{
    DaemonService, DaemonStatus, Engine, EngineSettings, InstanceSummary, ReconcileAction,
    ReconcileOutcome, RuntimeState,
};
use multiserve::{APP_NAME, APP_VERSION};

/// Supervise multiple model-server instances on one host
#[derive(Parser, Debug)]
#[command(name = "multiserve", version, about)]
struct Args {
    /// Data directory (defaults to the platform data directory)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start an instance
    Start { name: String },
    /// Stop an instance
    Stop {
        name: String,
        /// Seconds to wait after SIGTERM before SIGKILL
        #[arg(long)]
        grace: Option<u64>,
    },
    /// Restart an instance within its restart budget
    Restart { name: String },
    /// Show instance status
    Status { name: Option<String> },
    /// Show recent events
    Events {
        name: Option<String>,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Correct runtime state that disagrees with the process table
    Reconcile {
        name: Option<String>,
        /// Report drift without correcting it
        #[arg(long)]
        no_cleanup: bool,
        /// Also report processes of the managed executable without runtime state
        #[arg(long)]
        orphans: bool,
        /// Run a full pass even if one ran within the minimum interval
        #[arg(long)]
        force: bool,
    },
    /// Remove the runtime state of a stopped instance
    Purge { name: String },
    /// List instance locks
    Locks {
        /// Remove locks whose holder is gone or that are older than the stale timeout
        #[arg(long)]
        cleanup: bool,
    },
    /// Port helpers
    Port {
        #[command(subcommand)]
        command: PortCommand,
    },
    /// Run health checks and reconciliation in the foreground
    Daemon,
}

#[derive(Subcommand, Debug)]
enum PortCommand {
    /// Suggest a free port for an instance
    Suggest { name: String },
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let settings =
        EngineSettings::load(args.data_dir).context("Failed to load engine settings")?;

    let engine = Engine::open(settings).context("Failed to open engine")?;
    match args.command {
        Command::Start { name } => {
            let state = engine
                .supervisor()
                .start_instance(&name)
                .with_context(|| format!("Failed to start {}", name))?;
            println!("Started {} ({})", name, describe_process(&state));
        }
        Command::Stop { name, grace } => {
            let grace = grace.map(Duration::from_secs);
            engine
                .supervisor()
                .stop_instance(&name, grace)
                .with_context(|| format!("Failed to stop {}", name))?;
            println!("Stopped {}", name);
        }
        Command::Restart { name } => {
            let state = engine
                .supervisor()
                .restart_instance(&name)
                .with_context(|| format!("Failed to restart {}", name))?;
            println!(
                "Restarted {} ({}, restart {})",
                name,
                describe_process(&state),
                state.restart_count
            );
        }
        Command::Status { name: Some(name) } => print_instance(&engine, &name)?,
        Command::Status { name: None } => print_overview(&engine)?,
        Command::Events { name, limit } => {
            let events = engine.store().get_recent_events(name.as_deref(), limit)?;
            if events.is_empty() {
                println!("No events");
            }
            for event in events.iter().rev() {
                println!(
                    "{}  {:<16} {:<16} {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.name,
                    event.event_type,
                    event.detail.as_deref().unwrap_or("")
                );
            }
        }
        Command::Reconcile {
            name,
            no_cleanup,
            orphans,
            force,
        } => {
            let auto_cleanup = !no_cleanup;
            match name {
                Some(name) => {
                    let outcome = engine.reconciler().reconcile_instance(&name, auto_cleanup)?;
                    print_outcome(&outcome);
                }
                None => {
                    let scheduler = engine.reconcile_scheduler();
                    let report = if force {
                        scheduler.run_now(auto_cleanup, orphans)?
                    } else {
                        match scheduler.run(auto_cleanup, orphans)? {
                            Some(report) => report,
                            None => {
                                let last = scheduler
                                    .last_run()?
                                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                                    .unwrap_or_else(|| "-".to_string());
                                println!(
                                    "Skipped: last full pass started at {}, minimum interval {:?} (use --force)",
                                    last,
                                    scheduler.min_interval()
                                );
                                return Ok(());
                            }
                        }
                    };
                    for outcome in &report.outcomes {
                        print_outcome(outcome);
                    }
                    for orphan in &report.orphans {
                        println!(
                            "orphan pid {}: {}",
                            orphan.pid,
                            if orphan.command.is_empty() {
                                orphan.name.clone()
                            } else {
                                orphan.command.join(" ")
                            }
                        );
                    }
                    println!(
                        "Checked {}, {} action(s): {} stopped, {} error, {} purged, {} failed",
                        report.total_checked,
                        report.actions_taken,
                        report.stopped_count,
                        report.error_count,
                        report.purged_count,
                        report.failed_count
                    );
                }
            }
        }
        Command::Purge { name } => {
            if engine.supervisor().purge_instance(&name)? {
                println!("Purged {}", name);
            } else {
                println!("No runtime state for {}", name);
            }
        }
        Command::Locks { cleanup } => {
            if cleanup {
                let removed = engine.locks().cleanup_stale_locks()?;
                println!("Removed {} stale lock(s)", removed);
            }
            let locks = engine.locks().list_locks()?;
            if locks.is_empty() {
                println!("No locks held");
            }
            for (name, info) in locks {
                match info {
                    Some(info) => println!(
                        "{:<20} pid {:<8} {:<20} held {}s",
                        name,
                        info.pid,
                        info.operation,
                        info.age().as_secs()
                    ),
                    None => println!("{:<20} (unreadable)", name),
                }
            }
        }
        Command::Port {
            command: PortCommand::Suggest { name },
        } => {
            let preferred = engine.configs().get_instance_config(&name).ok().map(|c| c.port);
            match engine
                .supervisor()
                .ports()
                .suggest_port_for_instance(&name, preferred)?
            {
                Some(port) => println!("{}", port),
                None => anyhow::bail!(
                    "No free port in {:?} for {}",
                    engine.supervisor().ports().range(),
                    name
                ),
            }
        }
        Command::Daemon => return run_daemon(engine),
    }
    Ok(())
}

/// Initialize the logging system
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("multiserve=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn describe_process(state: &RuntimeState) -> String {
    match (state.pid, state.port) {
        (Some(pid), Some(port)) => format!("pid {}, port {}", pid, port),
        (Some(pid), None) => format!("pid {}", pid),
        _ => state.status.to_string(),
    }
}

fn print_outcome(outcome: &ReconcileOutcome) {
    let marker = match outcome.action {
        ReconcileAction::None => "ok",
        ReconcileAction::MarkedStopped => "stopped",
        ReconcileAction::MarkedError => "error",
    };
    println!("{:<20} {:<8} {}", outcome.name, marker, outcome.message);
}

fn print_instance(engine: &Engine, name: &str) -> Result<()> {
    let Some(state) = engine.instance_status(name)? else {
        println!("{}: no runtime state", name);
        return Ok(());
    };
    println!("{}", state.name);
    println!("  status:    {}", state.status);
    println!("  health:    {}", state.health.as_str());
    println!(
        "  pid:       {}",
        state.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into())
    );
    println!(
        "  port:      {}",
        state.port.map(|p| p.to_string()).unwrap_or_else(|| "-".into())
    );
    println!("  uptime:    {}", state.uptime_string());
    println!("  restarts:  {}", state.restart_count);
    if let Some(error) = &state.last_error {
        println!("  error:     {}", error);
    }
    if let Some(seen) = state.last_seen {
        println!("  last seen: {}", seen.format("%Y-%m-%d %H:%M:%S"));
    }
    Ok(())
}

fn print_overview(engine: &Engine) -> Result<()> {
    let path = engine.settings().get_daemon_status_path();
    match DaemonStatus::read(&path) {
        Some(daemon) if daemon.running => println!(
            "Daemon: running (pid {}, {} health checks, {} reconciliations)",
            daemon.pid, daemon.health_checks_performed, daemon.reconciliations_performed
        ),
        _ => println!("Daemon: not running"),
    }

    let rows = engine.list_status()?;
    if rows.is_empty() {
        println!("No instances configured");
        return Ok(());
    }
    println!(
        "{:<20} {:<9} {:<9} {:>8} {:>6} {:>9} {:>8}",
        "NAME", "STATUS", "HEALTH", "PID", "PORT", "UPTIME", "RESTARTS"
    );
    for row in rows {
        print_row(&row);
    }
    Ok(())
}

fn print_row(row: &InstanceSummary) {
    let name = if row.configured {
        row.name.clone()
    } else {
        format!("{}*", row.name)
    };
    match &row.state {
        Some(state) => println!(
            "{:<20} {:<9} {:<9} {:>8} {:>6} {:>9} {:>8}",
            name,
            state.status.as_str(),
            state.health.as_str(),
            state.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            state.port.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            state.uptime_string(),
            state.restart_count
        ),
        None => println!(
            "{:<20} {:<9} {:<9} {:>8} {:>6} {:>9} {:>8}",
            name, "stopped", "unknown", "-", "-", "-", 0
        ),
    }
}

fn run_daemon(engine: Engine) -> Result<()> {
    info!("{} v{} daemon starting...", APP_NAME, APP_VERSION);
    let settings = engine.settings();

    // Only one daemon per data directory
    let guard_name = format!(
        "{}-daemon-{:x}",
        APP_NAME,
        fnv1a(settings.get_data_directory().to_string_lossy().as_bytes())
    );
    let instance = SingleInstance::new(&guard_name).context("Failed to create daemon guard")?;
    if !instance.is_single() {
        error!("Another {} daemon is already running", APP_NAME);
        anyhow::bail!("daemon already running");
    }

    let shutdown_timeout = settings.shutdown_timeout();
    let engine = Arc::new(engine);
    let daemon = Arc::new(DaemonService::new(engine));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    let result = runtime.block_on(async {
        let signalled = Arc::clone(&daemon);
        tokio::spawn(async move {
            if let Err(e) = wait_for_shutdown_signal().await {
                error!(error = %e, "Error waiting for shutdown signal");
            }
            info!("Shutdown signal received");
            signalled.stop();
        });
        daemon.run().await
    });

    // Blocking work still running past the budget is abandoned
    runtime.shutdown_timeout(shutdown_timeout);
    if let Err(e) = &result {
        warn!("Daemon exited with error: {}", e);
    }
    drop(instance);
    result.context("Daemon failed")
}

/// Waits for a shutdown signal (SIGTERM or SIGINT)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

/// Stable short hash used to scope the daemon guard to a data directory
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
    })
}
