//! flowbus daemon entry point.
//!
//! Starts one port worker per configured serial port, logs the events they
//! publish, optionally accepts commands on stdin, and shuts the workers
//! down on SIGTERM/SIGINT.

mod console;
mod diagnostics;
mod signals;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam::channel::{self, Receiver};
use flowbus_common::{Address, DriverKind, PortConfig, PortName, ServiceConfig};
use flowbus_poller::{Command, Event, PortManager};
use flowbus_transport::{Connector, SimulatedBus};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::diagnostics::{format_prometheus_metrics, log_status, write_textfile};
use crate::signals::SignalHandler;

/// Main loop tick.
const TICK: Duration = Duration::from_millis(50);

/// flowbus daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "flowbus-daemon",
    about = "Polls mass-flow instruments on RS485 ports and applies setpoint commands",
    version,
    long_about = None
)]
struct Args {
    /// Path to a configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Use the simulated bus instead of serial ports.
    #[arg(long, short = 's')]
    simulated: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,

    /// Stop after this long, e.g. "30s" (0 = run until signalled).
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    run_for: Option<Duration>,

    /// Print every event as a JSON line on stdout.
    #[arg(long)]
    events_json: bool,

    /// Read command lines from stdin.
    #[arg(long)]
    stdin_commands: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting flowbus daemon");

    let mut config = load_config(&args)?;
    if args.simulated {
        config.driver = DriverKind::Simulated;
    }
    if config.ports.is_empty() {
        warn!("No ports configured, nothing will be polled");
    }

    info!(
        driver = ?config.driver,
        ports = config.ports.len(),
        poll_timeout_ms = config.transport.poll_timeout.as_millis(),
        "Configuration loaded"
    );

    let signal_handler = SignalHandler::new().context("Failed to set up signal handlers")?;

    run_daemon(&config, &args, &signal_handler)
}

/// Initialize logging. `RUST_LOG` wins over `level`.
fn init_logging(level: &str) {
    let filter = format!(
        "flowbus_daemon={level},flowbus_poller={level},flowbus_transport={level},flowbus_common={level}"
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `FLOWBUS_CONFIG_PATH` environment variable
/// 3. `/etc/flowbus/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<ServiceConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return ServiceConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"));
    }

    if let Ok(env_path) = std::env::var("FLOWBUS_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from FLOWBUS_CONFIG_PATH");
            return ServiceConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from FLOWBUS_CONFIG_PATH={env_path:?}")
            });
        }
        warn!(
            path = %env_path,
            "FLOWBUS_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    for path in ["/etc/flowbus/config.toml", "config/default.toml"] {
        let config_path = PathBuf::from(path);
        if config_path.exists() {
            info!(?config_path, "Loading config file");
            return ServiceConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {config_path:?}"));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(ServiceConfig::default())
}

/// Connector for one configured port.
fn create_connector(driver: DriverKind, port: &PortConfig) -> Arc<dyn Connector> {
    if driver == DriverKind::Serial {
        warn!(
            port = %port.name,
            baud_rate = port.baud_rate,
            "Serial wire codec not available in this build, falling back to simulated bus"
        );
    }
    let addresses: Vec<Address> = port.instruments.iter().map(|i| i.address).collect();
    info!(port = %port.name, instruments = addresses.len(), "Using simulated bus");
    Arc::new(SimulatedBus::with_instruments(&addresses))
}

/// Log one event, and print it as JSON if requested.
fn report_event(event: &Event, json: bool) -> Result<()> {
    match event {
        Event::Measurement(m) => {
            debug!(port = %m.port, address = %m.address, value = m.value, fluid = %m.fluid_name, "Measurement");
        }
        Event::Error(e) => {
            warn!(port = %e.port, address = %e.address, kind = %e.kind, message = %e.message, "Instrument error");
        }
        Event::Telemetry(t) => {
            info!(
                port = %t.port,
                address = %t.address,
                name = %t.name,
                value = %t.value,
                success = t.success,
                "Command finished"
            );
        }
        Event::AddressDisabled {
            port,
            address,
            consecutive_errors,
            cooldown,
        } => {
            error!(
                %port,
                %address,
                consecutive_errors,
                cooldown_secs = cooldown.as_secs_f64(),
                "Address disabled"
            );
        }
        Event::AddressRecovered {
            port,
            address,
            recovery_count,
        } => {
            info!(%port, %address, recovery_count, "Address recovered");
        }
    }

    if json {
        println!(
            "{}",
            serde_json::to_string(event).context("Failed to serialize event")?
        );
    }
    Ok(())
}

/// Main daemon run loop.
fn run_daemon(config: &ServiceConfig, args: &Args, signal_handler: &SignalHandler) -> Result<()> {
    let driver = config.driver;
    let mut manager = PortManager::from_config(config, |port| create_connector(driver, port))
        .context("Failed to start port workers")?;
    let events = manager.subscribe_all();
    info!(ports = manager.len(), "Port workers started");

    let commands: Option<Receiver<(PortName, Command)>> = if args.stdin_commands {
        let (tx, rx) = channel::bounded(config.scheduler.command_queue_capacity.max(1));
        console::spawn_stdin_reader(tx).context("Failed to start stdin reader")?;
        info!("Accepting commands on stdin");
        Some(rx)
    } else {
        None
    };

    let deadline = args
        .run_for
        .filter(|d| !d.is_zero())
        .map(|d| Instant::now() + d);
    let mut next_status = Instant::now() + config.metrics.status_interval;

    loop {
        signal_handler.poll();
        if signal_handler.shutdown_requested() {
            info!("Shutdown signal received, stopping port workers");
            break;
        }
        if signal_handler.take_reload_request() {
            info!("Reload requested (configuration reload needs a restart)");
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            info!("Run time elapsed");
            signal_handler.request_shutdown();
            break;
        }

        if let Ok(event) = events.recv_timeout(TICK) {
            report_event(&event, args.events_json)?;
            for event in events.try_iter() {
                report_event(&event, args.events_json)?;
            }
        }

        if let Some(commands) = &commands {
            for (port, command) in commands.try_iter() {
                let kind = command.kind.clone();
                match manager.enqueue_command(&port, command) {
                    Ok(()) => debug!(%port, command = %kind, "Command queued"),
                    Err(e) => warn!(%port, command = %kind, error = %e, "Command rejected"),
                }
            }
        }

        if Instant::now() >= next_status {
            next_status += config.metrics.status_interval;
            publish_status(&manager, config);
        }
    }

    info!("Shutting down...");
    let clean = manager.shutdown();
    for event in events.try_iter() {
        report_event(&event, args.events_json)?;
    }

    let stats = manager.all_stats();
    publish_status(&manager, config);
    info!(
        clean,
        ports = stats.len(),
        signals = signal_handler.state().signal_count(),
        "Daemon shutdown complete"
    );

    Ok(())
}

fn publish_status(manager: &PortManager, config: &ServiceConfig) {
    let stats = manager.all_stats();
    log_status(&stats);
    if let Some(path) = &config.metrics.textfile {
        if let Err(e) = write_textfile(path, &format_prometheus_metrics(&stats)) {
            warn!(path = %path.display(), error = %e, "Failed to write metrics textfile");
        }
    }
}
