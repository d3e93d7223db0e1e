//! Unix Socket Server
//!
//! Serves the query/command interface over newline-delimited JSON.
//!
//! # Limits
//! - **Socket**: mode 0660, stale socket removed on start, symlinks refused
//! - **Connections**: at most 64 concurrent clients
//! - **Messages**: requests larger than 8 KiB are rejected before buffering
//! - **Timeouts**: idle clients are dropped after 30 s, stuck writes after 10 s
//!
//! Queries answer from the controller's published state and never wait on
//! fan hardware. Commands are logged with the peer's uid/pid.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tc_core::{
    Alert, AlertSeverity, AlertStatus, ControlMode, FanState, RawSample, SensorReading,
    TemperatureUnit, ThermalError,
};
use tc_protocol::{
    AlertInfo, FanInfo, ReadingInfo, Request, RequestEnvelope, Response, ResponseData,
    ResponseEnvelope, StatusInfo, MAX_HISTORY_POINTS, MAX_MESSAGE_SIZE,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::fan_control::{wait_for_shutdown, DaemonState};

/// Maximum concurrent connections
const MAX_CONNECTIONS: usize = 64;

/// Read timeout for client requests
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Write timeout for responses
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Socket permissions: owner and group
const SOCKET_MODE: u32 = 0o660;

const VERSION: &str = env!("CARGO_PKG_VERSION");

static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

/// Who is on the other end of a connection
#[derive(Debug, Clone, Copy)]
struct Peer {
    uid: u32,
    pid: Option<i32>,
}

/// Bind the socket, replacing a stale one but never following a symlink
pub fn bind_socket(socket_path: &Path) -> std::io::Result<UnixListener> {
    if let Ok(metadata) = socket_path.symlink_metadata() {
        if metadata.file_type().is_symlink() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "socket path is a symlink, refusing to use it",
            ));
        }
        std::fs::remove_file(socket_path)?;
        debug!("Removed existing socket file");
    }

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
    Ok(listener)
}

/// Accept clients until shutdown
pub async fn run_server(listener: UnixListener, state: Arc<DaemonState>) {
    info!(max_conn = MAX_CONNECTIONS, max_msg = MAX_MESSAGE_SIZE, "Socket server accepting connections");
    let mut shutdown = state.shutdown_signal();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let current = ACTIVE_CONNECTIONS.load(Ordering::SeqCst);
                        if current >= MAX_CONNECTIONS {
                            warn!("Connection limit reached ({}), rejecting new connection", current);
                            drop(stream);
                            continue;
                        }

                        ACTIVE_CONNECTIONS.fetch_add(1, Ordering::SeqCst);
                        let state = state.clone();
                        tokio::spawn(async move {
                            handle_client(stream, state).await;
                            ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = wait_for_shutdown(&mut shutdown) => {
                info!("Socket server stopping");
                break;
            }
        }
    }
}

/// Read one line of at most `max_len` bytes without buffering beyond it
async fn read_line_bounded<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
    max_len: usize,
) -> std::io::Result<usize> {
    out.clear();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(0);
        }

        let (take_len, found_newline) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };

        let remaining = max_len.saturating_sub(out.len());
        if take_len > remaining {
            let consume_len = remaining.min(available.len());
            reader.consume(consume_len);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Message too large",
            ));
        }

        out.extend_from_slice(&available[..take_len]);
        reader.consume(take_len);

        if found_newline {
            return Ok(out.len());
        }
    }
}

async fn handle_client(stream: UnixStream, state: Arc<DaemonState>) {
    let peer = match stream.peer_cred() {
        Ok(cred) => Peer {
            uid: cred.uid(),
            pid: cred.pid(),
        },
        Err(e) => {
            error!("Failed to get peer credentials, rejecting connection: {}", e);
            return;
        }
    };
    debug!(uid = peer.uid, pid = ?peer.pid, "Client connected");

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line: Vec<u8> = Vec::with_capacity(1024);
    let mut request_count: u64 = 0;
    let connection_start = Instant::now();

    loop {
        let read_result = timeout(READ_TIMEOUT, read_line_bounded(&mut reader, &mut line, MAX_MESSAGE_SIZE)).await;

        match read_result {
            Ok(Ok(0)) => {
                debug!(
                    uid = peer.uid,
                    requests = request_count,
                    duration = ?connection_start.elapsed(),
                    "Client disconnected"
                );
                break;
            }
            Ok(Ok(n)) => {
                request_count += 1;
                trace!(uid = peer.uid, bytes = n, "Request #{}", request_count);

                let response = match std::str::from_utf8(&line) {
                    Ok(text) => process_request(text, &peer, &state).await,
                    Err(_) => ResponseEnvelope::new(0, Response::error("validation", "Invalid request encoding")),
                };

                if send_response(&mut writer, &response).await.is_err() {
                    break;
                }
            }
            Ok(Err(e)) => {
                if e.kind() == std::io::ErrorKind::InvalidData {
                    warn!(uid = peer.uid, max = MAX_MESSAGE_SIZE, "Message too large");
                    let response = ResponseEnvelope::new(0, Response::error("validation", "Message too large"));
                    let _ = send_response(&mut writer, &response).await;
                } else {
                    error!(uid = peer.uid, "Read error: {}", e);
                }
                break;
            }
            Err(_) => {
                debug!(uid = peer.uid, "Read timeout");
                break;
            }
        }
    }
}

async fn send_response(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    response: &ResponseEnvelope,
) -> Result<(), ()> {
    let json = serde_json::to_string(response).unwrap_or_else(|_| {
        r#"{"id":0,"status":"error","kind":"internal","message":"Serialization error"}"#.to_string()
    });

    let write_result = timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        Ok::<_, std::io::Error>(())
    })
    .await;

    match write_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("Write error: {}", e);
            Err(())
        }
        Err(_) => {
            error!("Write timeout");
            Err(())
        }
    }
}

async fn process_request(line: &str, peer: &Peer, state: &DaemonState) -> ResponseEnvelope {
    let envelope: RequestEnvelope = match serde_json::from_str(line.trim()) {
        Ok(e) => e,
        Err(e) => {
            debug!(uid = peer.uid, "Invalid JSON: {}", e);
            return ResponseEnvelope::new(0, Response::error("validation", "Invalid request format"));
        }
    };

    let request_id = envelope.id;
    let request = envelope.request;

    if let Err(e) = request.validate() {
        warn!(uid = peer.uid, cmd = request.type_name(), "Request validation failed: {}", e);
        return ResponseEnvelope::new(request_id, Response::error("validation", e));
    }

    if request.is_command() {
        info!(uid = peer.uid, pid = ?peer.pid, cmd = request.type_name(), id = request_id, "Command received");
    } else {
        debug!(uid = peer.uid, cmd = request.type_name(), id = request_id, "Query received");
    }

    let response = match dispatch(request, peer, state).await {
        Ok(data) => Response::Ok(data),
        Err(e) => {
            debug!(id = request_id, error = %e, "Request failed");
            Response::error(e.kind().as_str(), e.to_string())
        }
    };
    ResponseEnvelope::new(request_id, response)
}

async fn dispatch(request: Request, peer: &Peer, state: &DaemonState) -> tc_core::Result<ResponseData> {
    let ctrl = &state.controller;

    match request {
        Request::Ping => Ok(ResponseData::string("pong".into())),

        Request::Version => Ok(ResponseData::string(VERSION.into())),

        Request::GetLatestReadings { sensor_id } => {
            let readings = ctrl.get_latest_readings(sensor_id.as_deref()).await?;
            Ok(ResponseData::readings(readings.iter().map(reading_info).collect()))
        }

        Request::GetFanStates { fan_id } => {
            let fans = ctrl.get_fan_states(fan_id.as_deref())?;
            Ok(ResponseData::fans(fans.iter().map(fan_info).collect()))
        }

        Request::GetAlerts { status, severity } => {
            let status = status.as_deref().map(parse_status).transpose()?;
            let severity = severity.as_deref().map(parse_severity).transpose()?;
            let alerts = ctrl.get_alerts(status, severity);
            Ok(ResponseData::alerts(alerts.iter().map(alert_info).collect()))
        }

        Request::GetHistory { sensor_id, since_ms, until_ms } => {
            let since = from_millis("since_ms", since_ms)?;
            let until = from_millis("until_ms", until_ms)?;
            let mut readings = ctrl.get_history(&sensor_id, since, until).await?;
            if readings.len() > MAX_HISTORY_POINTS {
                let excess = readings.len() - MAX_HISTORY_POINTS;
                readings.drain(..excess);
            }
            Ok(ResponseData::readings(readings.iter().map(reading_info).collect()))
        }

        Request::SetFanSpeed { fan_id, percent } => {
            let fan = ctrl.set_fan_speed(&fan_id, i64::from(percent)).await?;
            Ok(ResponseData::fans(vec![fan_info(&fan)]))
        }

        Request::SetFanMode { fan_id, mode, target_temp } => {
            let mode = ControlMode::parse(&mode)
                .ok_or_else(|| ThermalError::invalid_value("mode", mode.clone(), "auto or manual"))?;
            let fan = ctrl.set_fan_mode(&fan_id, mode, target_temp).await?;
            Ok(ResponseData::fans(vec![fan_info(&fan)]))
        }

        Request::AcknowledgeAlert { alert_id, who, note } => {
            let alert = ctrl.acknowledge_alert(&alert_id, &who, note)?;
            info!(uid = peer.uid, alert = %alert_id, who = %who, "Alert acknowledged");
            Ok(ResponseData::alerts(vec![alert_info(&alert)]))
        }

        Request::ResolveAlert { alert_id, who, note } => {
            let alert = ctrl.resolve_alert(&alert_id, &who, note)?;
            info!(uid = peer.uid, alert = %alert_id, who = %who, "Alert resolved");
            Ok(ResponseData::alerts(vec![alert_info(&alert)]))
        }

        Request::IngestReading { sensor_id, value, unit, location, timestamp_ms } => {
            let unit = TemperatureUnit::parse(&unit)
                .ok_or_else(|| ThermalError::invalid_value("unit", unit.clone(), "celsius or fahrenheit"))?;
            let timestamp = match timestamp_ms {
                Some(ms) => from_millis("timestamp_ms", ms)?,
                None => Utc::now(),
            };
            let sample = RawSample {
                sensor_id,
                value,
                unit,
                location,
                timestamp,
            };
            let reading = ctrl.ingest(sample).await?;
            Ok(ResponseData::readings(vec![reading_info(&reading)]))
        }

        Request::ReloadConfig => state.reload().await.map(ResponseData::string),

        Request::GetStatus => Ok(ResponseData::status(status_info(state))),
    }
}

fn parse_status(s: &str) -> tc_core::Result<AlertStatus> {
    AlertStatus::parse(s).ok_or_else(|| ThermalError::invalid_value("status", s, "active, acknowledged or resolved"))
}

fn parse_severity(s: &str) -> tc_core::Result<AlertSeverity> {
    AlertSeverity::parse(s).ok_or_else(|| ThermalError::invalid_value("severity", s, "info, warning or critical"))
}

fn from_millis(field: &str, ms: i64) -> tc_core::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| ThermalError::out_of_range(field, ms as f64, 0.0, i64::MAX as f64))
}

// ============================================================================
// Wire conversions
// ============================================================================

fn reading_info(r: &SensorReading) -> ReadingInfo {
    ReadingInfo {
        sensor_id: r.sensor_id.clone(),
        celsius: r.value,
        location: r.location.clone(),
        status: r.status.as_str().to_string(),
        timestamp_ms: r.timestamp.timestamp_millis(),
    }
}

fn fan_info(f: &FanState) -> FanInfo {
    FanInfo {
        fan_id: f.fan_id.clone(),
        speed_percent: f.speed_percent,
        speed_rpm: f.speed_rpm,
        control_mode: f.control_mode.as_str().to_string(),
        target_temp: f.target_temp,
        status: f.status.as_str().to_string(),
        last_updated_ms: f.last_updated.timestamp_millis(),
    }
}

fn alert_info(a: &Alert) -> AlertInfo {
    AlertInfo {
        alert_id: a.alert_id.to_string(),
        source: a.source.clone(),
        condition: a.condition.as_str().to_string(),
        severity: a.severity.as_str().to_string(),
        status: a.status.as_str().to_string(),
        message: a.message.clone(),
        threshold: a.details.threshold,
        observed: a.details.observed,
        occurrences: a.details.occurrences,
        created_at_ms: a.created_at.timestamp_millis(),
        updated_at_ms: a.updated_at.timestamp_millis(),
        acknowledged_at_ms: a.acknowledged_at.map(|t| t.timestamp_millis()),
        acknowledged_by: a.acknowledged_by.clone(),
        resolved_at_ms: a.resolved_at.map(|t| t.timestamp_millis()),
        resolved_by: a.resolved_by.clone(),
        note: a.note.clone(),
    }
}

fn status_info(state: &DaemonState) -> StatusInfo {
    let status = state.controller.status();
    let last = status.last_cycle.as_ref();
    StatusInfo {
        version: VERSION.to_string(),
        cycles: status.cycles,
        last_cycle_ms: last.map(|c| c.started_at.timestamp_millis()),
        last_cycle_duration_ms: last.map(|c| c.duration.as_millis() as u64),
        last_cycle_failures: last.map(|c| c.failures).unwrap_or(0),
        store_degraded: last.map(|c| c.store_degraded).unwrap_or(false),
        fans: status.fans,
        sensors: status.sensors,
        open_alerts: status.open_alerts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::hardware::SysfsFanDriver;
    use tc_core::{FanPolicy, InMemoryHistoryStore, SensorPolicy, SensorThresholds, ThermalController, TracingAlertSink};
    use tempfile::TempDir;

    const PEER: Peer = Peer { uid: 0, pid: None };

    async fn state(dir: &TempDir) -> Arc<DaemonState> {
        let mut config: DaemonConfig = serde_json::from_str(r#"{"state_path": null, "policy": {}}"#).unwrap();
        config.policy.fans.push(FanPolicy::new("CPU_FAN_1", vec!["CPU_TEMP_1".into()], 65.0));
        config.policy.sensors.push(SensorPolicy {
            sensor_id: "CPU_TEMP_1".into(),
            location: "cpu package".into(),
            thresholds: Some(SensorThresholds {
                warning_threshold: 80.0,
                critical_threshold: 90.0,
            }),
        });
        config.hardware.fans.push(crate::config::FanBinding {
            fan_id: "CPU_FAN_1".into(),
            pwm_path: dir.path().join("pwm1"),
            rpm_path: None,
            pwm_max: 255,
        });
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, serde_json::to_string(&config).unwrap()).unwrap();

        let driver = Arc::new(SysfsFanDriver::new(&config.hardware.fans));
        let controller = ThermalController::new(
            Arc::new(InMemoryHistoryStore::new()),
            driver.clone(),
            Arc::new(TracingAlertSink),
            config.policy.clone(),
            config.controller_options(),
        )
        .await
        .unwrap();
        Arc::new(DaemonState::new(controller, driver, config_path, config))
    }

    async fn call(state: &DaemonState, request: Request) -> Response {
        let line = serde_json::to_string(&RequestEnvelope::with_id(request, 7)).unwrap();
        let envelope = process_request(&line, &PEER, state).await;
        assert_eq!(envelope.id, 7);
        envelope.response
    }

    fn error_kind(response: Response) -> String {
        match response {
            Response::Error { kind, .. } => kind,
            Response::Ok(_) => panic!("expected error response"),
        }
    }

    #[tokio::test]
    async fn test_ingest_then_query() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir).await;

        let resp = call(
            &state,
            Request::IngestReading {
                sensor_id: "CPU_TEMP_1".into(),
                value: 185.0,
                unit: "fahrenheit".into(),
                location: None,
                timestamp_ms: Some(1_700_000_000_000),
            },
        )
        .await;
        let Response::Ok(data) = resp else { panic!("ingest failed") };
        let reading = &data.readings.unwrap()[0];
        assert!((reading.celsius - 85.0).abs() < 1e-9);
        assert_eq!(reading.status, "warning");
        assert_eq!(reading.location, "cpu package");
        assert_eq!(reading.timestamp_ms, 1_700_000_000_000);

        let Response::Ok(data) = call(&state, Request::GetLatestReadings { sensor_id: None }).await else {
            panic!("query failed")
        };
        assert_eq!(data.readings.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_set_speed_out_of_range() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir).await;

        let resp = call(&state, Request::SetFanSpeed { fan_id: "CPU_FAN_1".into(), percent: 150 }).await;
        assert_eq!(error_kind(resp), "validation");
        assert!(!dir.path().join("pwm1").exists());

        let Response::Ok(data) = call(&state, Request::SetFanSpeed { fan_id: "CPU_FAN_1".into(), percent: 40 }).await
        else {
            panic!("set speed failed")
        };
        let fan = &data.fans.unwrap()[0];
        assert_eq!(fan.control_mode, "manual");
        assert_eq!(std::fs::read_to_string(dir.path().join("pwm1")).unwrap(), "102");
    }

    #[tokio::test]
    async fn test_not_found_kinds() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir).await;

        let resp = call(&state, Request::GetFanStates { fan_id: Some("GPU_FAN_9".into()) }).await;
        assert_eq!(error_kind(resp), "not_found");

        let resp = call(
            &state,
            Request::ResolveAlert {
                alert_id: "6f1c2f8e-3f0a-4c1e-9d7b-2a4b5c6d7e8f".into(),
                who: "oncall".into(),
                note: None,
            },
        )
        .await;
        assert_eq!(error_kind(resp), "not_found");
    }

    #[tokio::test]
    async fn test_unknown_choice_names_field() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir).await;

        let request = Request::SetFanMode { fan_id: "CPU_FAN_1".into(), mode: "turbo".into(), target_temp: None };
        let err = dispatch(request, &PEER, &state).await.unwrap_err();
        assert!(matches!(&err, ThermalError::InvalidValue { field, .. } if field == "mode"));
        assert_eq!(err.kind().as_str(), "validation");

        let request = Request::IngestReading {
            sensor_id: "CPU_TEMP_1".into(),
            value: 40.0,
            unit: "kelvin".into(),
            location: None,
            timestamp_ms: None,
        };
        let err = dispatch(request, &PEER, &state).await.unwrap_err();
        assert!(matches!(&err, ThermalError::InvalidValue { field, .. } if field == "unit"));

        assert!(matches!(parse_severity("loud"), Err(ThermalError::InvalidValue { .. })));
    }

    #[tokio::test]
    async fn test_malformed_request() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir).await;

        let envelope = process_request("{\"id\": 3, \"cmd\": \"Explode\"}", &PEER, &state).await;
        assert_eq!(envelope.id, 0);
        assert_eq!(error_kind(envelope.response), "validation");
    }

    #[tokio::test]
    async fn test_status_and_reload() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir).await;
        state.controller.run_cycle().await;

        let Response::Ok(data) = call(&state, Request::GetStatus).await else { panic!("status failed") };
        let status = data.status.unwrap();
        assert_eq!(status.cycles, 1);
        assert_eq!(status.fans, 1);
        // No reading for the bound sensor yet
        assert!(status.open_alerts >= 1);

        let Response::Ok(data) = call(&state, Request::ReloadConfig).await else { panic!("reload failed") };
        assert!(data.value.unwrap().contains("1 fans"));
    }

    #[tokio::test]
    async fn test_read_line_bounded_rejects_oversized() {
        let big = vec![b'x'; MAX_MESSAGE_SIZE + 10];
        let mut reader = BufReader::new(&big[..]);
        let mut out = Vec::new();
        let err = read_line_bounded(&mut reader, &mut out, MAX_MESSAGE_SIZE).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

        let mut reader = BufReader::new(&b"{\"id\":1}\nrest"[..]);
        assert_eq!(read_line_bounded(&mut reader, &mut out, MAX_MESSAGE_SIZE).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_bind_refuses_symlink() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target");
        std::fs::write(&target, "").unwrap();
        let link = dir.path().join("thermctld.sock");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert!(bind_socket(&link).is_err());
        assert!(target.exists());
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("thermctld.sock");
        drop(bind_socket(&path).unwrap());
        let _listener = bind_socket(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, SOCKET_MODE);
    }
}
