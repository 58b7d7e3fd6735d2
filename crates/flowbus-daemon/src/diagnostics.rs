//! Status reporting for the daemon.
//!
//! Per-port status log lines and a Prometheus text exposition of the
//! per-address statistics, written to a file for the node exporter's
//! textfile collector.

use flowbus_common::HealthState;
use flowbus_poller::{AddressStats, ConnectionStats};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Log one status line per port and one per address.
pub fn log_status(stats: &[ConnectionStats]) {
    for port in stats {
        info!(
            port = %port.port,
            uptime_secs = port.uptime.as_secs(),
            addresses = port.addresses.len(),
            commands = port.commands_processed,
            commands_failed = port.commands_failed,
            events_dropped = port.events_dropped,
            generation = port.connection_generation,
            "Port status"
        );
        for (address, a) in &port.addresses {
            info!(
                port = %port.port,
                %address,
                state = %a.health.state,
                polls = a.polls,
                skipped = a.skipped_polls,
                consecutive_errors = a.health.consecutive_errors,
                recoveries = a.health.recovery_count,
                mean_interval_ms = a.intervals.mean.map_or(0, |d| d.as_millis()),
                "Address status"
            );
        }
    }
}

fn state_value(state: HealthState) -> u8 {
    match state {
        HealthState::Healthy => 0,
        HealthState::Degraded => 1,
        HealthState::Disabled => 2,
    }
}

fn header(output: &mut String, name: &str, kind: &str, help: &str) {
    output.push_str(&format!("# HELP {name} {help}\n"));
    output.push_str(&format!("# TYPE {name} {kind}\n"));
}

fn address_metric(
    output: &mut String,
    stats: &[ConnectionStats],
    name: &str,
    value: impl Fn(&AddressStats) -> Option<String>,
) {
    for port in stats {
        for (address, a) in &port.addresses {
            if let Some(v) = value(a) {
                output.push_str(&format!(
                    "{name}{{port=\"{}\",address=\"{address}\"}} {v}\n",
                    port.port
                ));
            }
        }
    }
}

fn port_metric(
    output: &mut String,
    stats: &[ConnectionStats],
    name: &str,
    value: impl Fn(&ConnectionStats) -> String,
) {
    for port in stats {
        output.push_str(&format!("{name}{{port=\"{}\"}} {}\n", port.port, value(port)));
    }
}

fn seconds(d: Duration) -> String {
    format!("{:.6}", d.as_secs_f64())
}

/// Format all port statistics in Prometheus text exposition format.
pub fn format_prometheus_metrics(stats: &[ConnectionStats]) -> String {
    let mut output = String::new();

    header(&mut output, "flowbus_uptime_seconds", "gauge", "Port worker uptime");
    port_metric(&mut output, stats, "flowbus_uptime_seconds", |p| {
        format!("{:.3}", p.uptime.as_secs_f64())
    });

    header(&mut output, "flowbus_commands_total", "counter", "Commands executed");
    port_metric(&mut output, stats, "flowbus_commands_total", |p| {
        p.commands_processed.to_string()
    });

    header(&mut output, "flowbus_commands_failed_total", "counter", "Commands that failed");
    port_metric(&mut output, stats, "flowbus_commands_failed_total", |p| {
        p.commands_failed.to_string()
    });

    header(
        &mut output,
        "flowbus_events_dropped_total",
        "counter",
        "Events lost to slow subscribers",
    );
    port_metric(&mut output, stats, "flowbus_events_dropped_total", |p| {
        p.events_dropped.to_string()
    });

    header(
        &mut output,
        "flowbus_connection_generation",
        "gauge",
        "Master connections opened on the port",
    );
    port_metric(&mut output, stats, "flowbus_connection_generation", |p| {
        p.connection_generation.to_string()
    });

    header(
        &mut output,
        "flowbus_address_state",
        "gauge",
        "Address health (0=healthy, 1=degraded, 2=disabled)",
    );
    address_metric(&mut output, stats, "flowbus_address_state", |a| {
        Some(state_value(a.health.state).to_string())
    });

    header(
        &mut output,
        "flowbus_consecutive_errors",
        "gauge",
        "Failures since the last success",
    );
    address_metric(&mut output, stats, "flowbus_consecutive_errors", |a| {
        Some(a.health.consecutive_errors.to_string())
    });

    header(&mut output, "flowbus_recoveries_total", "counter", "Recovered error streaks");
    address_metric(&mut output, stats, "flowbus_recoveries_total", |a| {
        Some(a.health.recovery_count.to_string())
    });

    header(&mut output, "flowbus_errors_total", "counter", "Failed polls and commands");
    address_metric(&mut output, stats, "flowbus_errors_total", |a| {
        Some(a.health.total_errors.to_string())
    });

    header(&mut output, "flowbus_polls_total", "counter", "Polls attempted");
    address_metric(&mut output, stats, "flowbus_polls_total", |a| Some(a.polls.to_string()));

    header(&mut output, "flowbus_polls_skipped_total", "counter", "Polls skipped while disabled");
    address_metric(&mut output, stats, "flowbus_polls_skipped_total", |a| {
        Some(a.skipped_polls.to_string())
    });

    header(
        &mut output,
        "flowbus_poll_interval_mean_seconds",
        "gauge",
        "Mean time between polls",
    );
    address_metric(&mut output, stats, "flowbus_poll_interval_mean_seconds", |a| {
        a.intervals.mean.map(seconds)
    });

    header(
        &mut output,
        "flowbus_poll_interval_late_total",
        "counter",
        "Poll intervals longer than period plus fairness window",
    );
    address_metric(&mut output, stats, "flowbus_poll_interval_late_total", |a| {
        Some(a.intervals.late_count.to_string())
    });

    header(&mut output, "flowbus_measured_flow", "gauge", "Last measured flow");
    address_metric(&mut output, stats, "flowbus_measured_flow", |a| {
        a.last_value.map(|v| v.to_string())
    });

    output
}

/// Replace `path` with `content`, going through a temporary file in the
/// same directory so readers never see a partial file.
pub fn write_textfile(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("prom.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}
