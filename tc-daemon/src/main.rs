//! thermctl Daemon (thermctld)
//!
//! Closed-loop thermal control service. Polls temperature sensors, runs the
//! control cycle that drives hwmon fans, tracks alerts, and serves queries
//! and operator commands over a Unix domain socket.
//!
//! # Startup
//! 1. Restrictive umask, logging, config load
//! 2. PID file (refuses to start next to a live instance)
//! 3. Restore persisted fan modes and open alerts
//! 4. Boot fail-safe: every fan to its max (Auto) or operator (Manual) speed
//! 5. Sensor pollers, control loop, retention task, socket server
//!
//! # Shutdown
//! SIGINT/SIGTERM stop the server and loops, write a final state snapshot
//! and remove the socket and PID file.

mod config;
mod fan_control;
mod hardware;
mod sensor_poll;
mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use tc_core::constants::paths;
use tc_core::{load_snapshot, save_snapshot, InMemoryHistoryStore, ThermalController, TracingAlertSink};
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::fan_control::DaemonState;
use crate::hardware::SysfsFanDriver;

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct Args {
    config_path: PathBuf,
    socket_override: Option<PathBuf>,
    pid_file: PathBuf,
}

// ============================================================================
// Process setup
// ============================================================================

/// Set restrictive umask; the socket gets its mode explicitly
fn set_secure_umask() {
    // SAFETY: umask only sets the file creation mask for the process.
    unsafe { libc::umask(0o077) };
}

fn init_logging() -> &'static str {
    let log_level = std::env::var("THERMCTL_LOG").unwrap_or_else(|_| "info".to_string());

    if Path::new("/run/systemd/journal/socket").exists() {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(&log_level))
                    .init();
                return "systemd journal";
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stdout", e);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(&log_level)
        .init();
    "stdout"
}

/// Write the PID file, clearing a stale one left by a dead process
fn write_pid_file(path: &Path) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    if let Ok(content) = std::fs::read_to_string(path) {
        if let Ok(old_pid) = content.trim().parse::<i32>() {
            // SAFETY: signal 0 only checks that the process exists.
            if unsafe { libc::kill(old_pid, 0) } == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    format!("another instance is running (PID {})", old_pid),
                ));
            }
        }
        std::fs::remove_file(path)?;
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(path)?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()?;

    debug!("PID file written: {}", path.display());
    Ok(())
}

fn cleanup(socket_path: &Path, pid_file: &Path) {
    for path in [socket_path, pid_file] {
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }
}

// ============================================================================
// CLI
// ============================================================================

fn print_help() {
    eprintln!("thermctld {} - thermal control daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    thermctld [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --config PATH   Config file (default {})", paths::DEFAULT_CONFIG_PATH);
    eprintln!("    -s, --socket PATH   Override the socket path from the config");
    eprintln!("    -p, --pid-file PATH PID file (default {})", paths::DEFAULT_PID_FILE);
    eprintln!("    -f, --foreground    Run in foreground (always on)");
    eprintln!("    -v, --version       Print version");
    eprintln!("    -h, --help          Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    THERMCTL_LOG        Log filter (trace, debug, info, warn, error)");
}

/// `Ok(None)` means help or version was printed
fn parse_args() -> anyhow::Result<Option<Args>> {
    let mut args = Args {
        config_path: PathBuf::from(paths::DEFAULT_CONFIG_PATH),
        socket_override: None,
        pid_file: PathBuf::from(paths::DEFAULT_PID_FILE),
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            }
            "-v" | "--version" => {
                println!("thermctld {}", VERSION);
                return Ok(None);
            }
            "-f" | "--foreground" => {}
            "-c" | "--config" => {
                args.config_path = iter.next().context("--config requires a path argument")?.into();
            }
            "-s" | "--socket" => {
                args.socket_override = Some(iter.next().context("--socket requires a path argument")?.into());
            }
            "-p" | "--pid-file" => {
                args.pid_file = iter.next().context("--pid-file requires a path argument")?.into();
            }
            other => {
                print_help();
                bail!("unknown argument: {}", other);
            }
        }
    }

    Ok(Some(args))
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let Some(args) = parse_args()? else {
        return Ok(());
    };

    set_secure_umask();
    let log_target = init_logging();
    info!(version = VERSION, logging = log_target, "thermctld starting");

    let mut config = DaemonConfig::load(&args.config_path)
        .with_context(|| format!("failed to load config {}", args.config_path.display()))?;
    if let Some(socket) = args.socket_override {
        config.socket_path = socket;
    }
    info!(
        config = %args.config_path.display(),
        fans = config.policy.fans.len(),
        sensors = config.policy.all_sensor_ids().len(),
        "Configuration loaded"
    );

    write_pid_file(&args.pid_file).with_context(|| format!("could not write PID file {}", args.pid_file.display()))?;

    let result = run(config.clone(), args.config_path).await;

    cleanup(&config.socket_path, &args.pid_file);
    if let Err(e) = &result {
        error!("thermctld exiting with error: {:#}", e);
    } else {
        info!("thermctld stopped");
    }
    result
}

async fn run(config: DaemonConfig, config_path: PathBuf) -> anyhow::Result<()> {
    let driver = Arc::new(SysfsFanDriver::new(&config.hardware.fans));
    let controller = ThermalController::new(
        Arc::new(InMemoryHistoryStore::new()),
        driver.clone(),
        Arc::new(TracingAlertSink),
        config.policy.clone(),
        config.controller_options(),
    )
    .await
    .context("failed to build controller")?;

    if let Some(state_path) = &config.state_path {
        match load_snapshot(state_path) {
            Ok(Some(snapshot)) => controller.restore(snapshot).await,
            Ok(None) => debug!("No persisted state"),
            Err(e) => warn!(path = %state_path.display(), error = %e, "Ignoring unreadable state snapshot"),
        }
    }

    let failed = controller
        .initialize()
        .await
        .into_iter()
        .filter(|(_, result)| result.is_err())
        .count();
    if failed > 0 {
        warn!(failed, "Some fans did not accept their boot speed");
    }

    let listener = server::bind_socket(&config.socket_path)
        .with_context(|| format!("failed to bind {}", config.socket_path.display()))?;
    info!(socket = %config.socket_path.display(), "Listening");

    let state = Arc::new(DaemonState::new(controller.clone(), driver, config_path, config.clone()));

    let signal_state = state.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received SIGINT/SIGTERM, shutting down");
        signal_state.request_shutdown();
    }) {
        warn!("Failed to set signal handler: {}", e);
    }

    state.start_pollers();
    let control = tokio::spawn(fan_control::run_control_loop(state.clone()));
    let retention = tokio::spawn(fan_control::run_retention(state.clone()));

    server::run_server(listener, state.clone()).await;

    state.request_shutdown();
    state.stop_pollers();
    for (name, task) in [("control loop", control), ("retention", retention)] {
        if let Err(e) = task.await {
            error!("{} task failed: {}", name, e);
        }
    }

    if let Some(state_path) = &config.state_path {
        let snapshot = controller.snapshot();
        if let Err(e) = save_snapshot(state_path, &snapshot) {
            warn!(error = %e, "Failed to write final state snapshot");
        }
    }

    Ok(())
}
