//! Command Line Interface
//!
//! Every command is one request to `thermctld`; output is a plain table, or
//! the wire JSON with `--json`.

use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::{DateTime, Duration, Local, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tc_core::constants::paths;
use tc_core::daemon_client::is_daemon_available;
use tc_core::DaemonClient;
use tc_protocol::{AlertInfo, FanInfo, ReadingInfo, StatusInfo};

/// Longest `history` window (one year)
const MAX_HISTORY_MINUTES: i64 = 60 * 24 * 365;

#[derive(Parser)]
#[command(name = "thermctl")]
#[command(version)]
#[command(about = "thermctl - query and command the thermal control daemon")]
#[command(long_about = "thermctl - query and command the thermal control daemon

EXAMPLES:
    thermctl status                          Control loop health
    thermctl readings                        Latest reading of every sensor
    thermctl fans CPU_FAN_1                  One fan's state
    thermctl alerts --status active          Open alerts
    thermctl history GPU_TEMP_1 --minutes 30
    thermctl set-speed CPU_FAN_1 80          Manual override at 80%
    thermctl set-mode CPU_FAN_1 auto --target 60
    thermctl ack 6f1c2f8e-3f0a-4c1e-9d7b-2a4b5c6d7e8f --note \"looking\"
    thermctl ingest CHASSIS_TEMP_1 31.5

ENVIRONMENT VARIABLES:
    THERMCTL_SOCKET        Daemon socket path
    RUST_LOG=debug         Enable debug logging")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Daemon socket
    #[arg(long, env = "THERMCTL_SOCKET", default_value = paths::DEFAULT_SOCKET_PATH, global = true)]
    pub socket: PathBuf,

    /// Print the raw JSON response
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Latest reading per sensor
    Readings {
        sensor_id: Option<String>,
    },

    /// Current fan states
    Fans {
        fan_id: Option<String>,
    },

    /// List alerts, newest first
    Alerts {
        /// active, acknowledged or resolved
        #[arg(long)]
        status: Option<String>,
        /// info, warning or critical
        #[arg(long)]
        severity: Option<String>,
    },

    /// Stored readings for one sensor
    History {
        sensor_id: String,
        /// Window length ending now
        #[arg(long, default_value_t = 60)]
        minutes: i64,
    },

    /// Put a fan under manual control
    SetSpeed {
        fan_id: String,
        #[arg(allow_negative_numbers = true)]
        percent: i32,
    },

    /// Switch a fan between auto and manual
    SetMode {
        fan_id: String,
        /// auto or manual
        mode: String,
        /// Target temperature in °C (required for auto)
        #[arg(long)]
        target: Option<f64>,
    },

    /// Acknowledge an active alert
    Ack {
        alert_id: String,
        #[arg(long, env = "USER", default_value = "operator")]
        who: String,
        #[arg(long)]
        note: Option<String>,
    },

    /// Resolve an alert
    Resolve {
        alert_id: String,
        #[arg(long, env = "USER", default_value = "operator")]
        who: String,
        #[arg(long)]
        note: Option<String>,
    },

    /// Push one reading
    Ingest {
        sensor_id: String,
        #[arg(allow_negative_numbers = true)]
        value: f64,
        /// celsius or fahrenheit
        #[arg(long, default_value = "celsius")]
        unit: String,
        #[arg(long)]
        location: Option<String>,
    },

    /// Re-read the daemon's config file
    Reload,

    /// Control loop health summary
    Status,

    /// Check the daemon is answering
    Ping,
}

// ============================================================================
// CLI Execution
// ============================================================================

pub fn run_cli(cli: &Cli) -> anyhow::Result<()> {
    if !is_daemon_available(&cli.socket) {
        bail!("thermctld is not running (no socket at {})", cli.socket.display());
    }
    let mut client = DaemonClient::connect(&cli.socket)
        .with_context(|| format!("is thermctld running? (socket {})", cli.socket.display()))?;

    let out = match &cli.command {
        Commands::Readings { sensor_id } => {
            let readings = client.latest_readings(sensor_id.clone())?;
            render(cli.json, &readings, format_readings)?
        }
        Commands::Fans { fan_id } => {
            let fans = client.fan_states(fan_id.clone())?;
            render(cli.json, &fans, format_fans)?
        }
        Commands::Alerts { status, severity } => {
            let alerts = client.alerts(status.clone(), severity.clone())?;
            render(cli.json, &alerts, format_alerts)?
        }
        Commands::History { sensor_id, minutes } => {
            let until = Utc::now();
            let since = until - Duration::minutes((*minutes).clamp(1, MAX_HISTORY_MINUTES));
            let readings = client.history(sensor_id.clone(), since.timestamp_millis(), until.timestamp_millis())?;
            render(cli.json, &readings, format_readings)?
        }
        Commands::SetSpeed { fan_id, percent } => {
            let fan = client.set_fan_speed(fan_id.clone(), *percent)?;
            render(cli.json, &vec![fan], format_fans)?
        }
        Commands::SetMode { fan_id, mode, target } => {
            let fan = client.set_fan_mode(fan_id.clone(), mode.clone(), *target)?;
            render(cli.json, &vec![fan], format_fans)?
        }
        Commands::Ack { alert_id, who, note } => {
            let alert = client.acknowledge_alert(alert_id.clone(), who.clone(), note.clone())?;
            render(cli.json, &vec![alert], format_alerts)?
        }
        Commands::Resolve { alert_id, who, note } => {
            let alert = client.resolve_alert(alert_id.clone(), who.clone(), note.clone())?;
            render(cli.json, &vec![alert], format_alerts)?
        }
        Commands::Ingest { sensor_id, value, unit, location } => {
            let reading = client.ingest(sensor_id.clone(), *value, unit.clone(), location.clone(), None)?;
            render(cli.json, &vec![reading], format_readings)?
        }
        Commands::Reload => client.reload_config()?,
        Commands::Status => {
            let status = client.status()?;
            render(cli.json, &status, format_status)?
        }
        Commands::Ping => {
            client.ping()?;
            format!("pong from thermctld {}", client.version()?)
        }
    };

    println!("{}", out);
    Ok(())
}

fn render<T: Serialize + ?Sized>(json: bool, value: &T, table: fn(&T) -> String) -> anyhow::Result<String> {
    if json {
        Ok(serde_json::to_string_pretty(value)?)
    } else {
        Ok(table(value))
    }
}

// ============================================================================
// Formatting
// ============================================================================

fn local_time(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn format_readings(readings: &Vec<ReadingInfo>) -> String {
    if readings.is_empty() {
        return "No readings".to_string();
    }
    let mut out = format!("{:<20} {:>8} {:<9} {:<20} {}", "SENSOR", "TEMP", "STATUS", "TIME", "LOCATION");
    for r in readings {
        out.push_str(&format!(
            "\n{:<20} {:>6.1}°C {:<9} {:<20} {}",
            r.sensor_id,
            r.celsius,
            r.status,
            local_time(r.timestamp_ms),
            r.location
        ));
    }
    out
}

fn format_fans(fans: &Vec<FanInfo>) -> String {
    if fans.is_empty() {
        return "No fans".to_string();
    }
    let mut out = format!("{:<20} {:>5} {:>7} {:<7} {:>7} {}", "FAN", "SPEED", "RPM", "MODE", "TARGET", "STATUS");
    for f in fans {
        let rpm = f.speed_rpm.map(|r| r.to_string()).unwrap_or_else(|| "-".into());
        let target = f.target_temp.map(|t| format!("{:.1}°C", t)).unwrap_or_else(|| "-".into());
        out.push_str(&format!(
            "\n{:<20} {:>4}% {:>7} {:<7} {:>7} {}",
            f.fan_id, f.speed_percent, rpm, f.control_mode, target, f.status
        ));
    }
    out
}

fn format_alerts(alerts: &Vec<AlertInfo>) -> String {
    if alerts.is_empty() {
        return "No alerts".to_string();
    }
    let mut out = String::new();
    for a in alerts {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!(
            "{} [{}] {} {} on {}: {}",
            a.alert_id, a.severity, a.status, a.condition, a.source, a.message
        ));
        out.push_str(&format!(
            "\n    since {} (x{})",
            local_time(a.created_at_ms),
            a.occurrences
        ));
        if let Some(by) = &a.acknowledged_by {
            out.push_str(&format!(", acknowledged by {}", by));
        }
        if let Some(by) = &a.resolved_by {
            out.push_str(&format!(", resolved by {}", by));
        }
        if let Some(note) = &a.note {
            out.push_str(&format!("\n    note: {}", note));
        }
    }
    out
}

fn format_status(s: &StatusInfo) -> String {
    let last = match (s.last_cycle_ms, s.last_cycle_duration_ms) {
        (Some(at), Some(ms)) => format!("{} ({} ms, {} failures)", local_time(at), ms, s.last_cycle_failures),
        _ => "never".to_string(),
    };
    format!(
        "thermctld {}\nCycles:      {}\nLast cycle:  {}\nStore:       {}\nFans:        {}\nSensors:     {}\nOpen alerts: {}",
        s.version,
        s.cycles,
        last,
        if s.store_degraded { "DEGRADED" } else { "ok" },
        s.fans,
        s.sensors,
        s.open_alerts
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("thermctl").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_parse_set_speed() {
        let cli = parse(&["set-speed", "CPU_FAN_1", "80"]);
        assert_eq!(cli.command, Commands::SetSpeed { fan_id: "CPU_FAN_1".into(), percent: 80 });
        assert!(!cli.json);
    }

    #[test]
    fn test_negative_speed_reaches_daemon() {
        let cli = parse(&["set-speed", "CPU_FAN_1", "-5"]);
        assert_eq!(cli.command, Commands::SetSpeed { fan_id: "CPU_FAN_1".into(), percent: -5 });
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = parse(&["alerts", "--status", "active", "--json", "--socket", "/tmp/t.sock"]);
        assert!(cli.json);
        assert_eq!(cli.socket, PathBuf::from("/tmp/t.sock"));
        assert_eq!(
            cli.command,
            Commands::Alerts { status: Some("active".into()), severity: None }
        );
    }

    #[test]
    fn test_parse_set_mode_with_target() {
        let cli = parse(&["set-mode", "GPU_FAN_1", "auto", "--target", "70"]);
        assert_eq!(
            cli.command,
            Commands::SetMode { fan_id: "GPU_FAN_1".into(), mode: "auto".into(), target: Some(70.0) }
        );
    }

    #[test]
    fn test_missing_argument_rejected() {
        assert!(Cli::try_parse_from(["thermctl", "set-speed", "CPU_FAN_1"]).is_err());
    }

    #[test]
    fn test_format_fans() {
        let fans = vec![FanInfo {
            fan_id: "CPU_FAN_1".into(),
            speed_percent: 100,
            speed_rpm: Some(2400),
            control_mode: "auto".into(),
            target_temp: None,
            status: "normal".into(),
            last_updated_ms: 0,
        }];
        let table = format_fans(&fans);
        let row = table.lines().nth(1).unwrap();
        assert!(row.starts_with("CPU_FAN_1"));
        assert!(row.contains("100%"));
        assert!(row.contains("2400"));
        assert_eq!(format_fans(&Vec::new()), "No fans");
    }

    #[test]
    fn test_format_status_never_ran() {
        let status = StatusInfo {
            version: "0.1.0".into(),
            cycles: 0,
            last_cycle_ms: None,
            last_cycle_duration_ms: None,
            last_cycle_failures: 0,
            store_degraded: true,
            fans: 2,
            sensors: 3,
            open_alerts: 1,
        };
        let text = format_status(&status);
        assert!(text.contains("Last cycle:  never"));
        assert!(text.contains("DEGRADED"));
    }

    #[test]
    fn test_render_json() {
        let readings = vec![ReadingInfo {
            sensor_id: "CPU_TEMP_1".into(),
            celsius: 42.0,
            location: String::new(),
            status: "normal".into(),
            timestamp_ms: 0,
        }];
        let json = render(true, &readings, format_readings).unwrap();
        assert!(json.contains("\"celsius\": 42.0"));
    }
}
