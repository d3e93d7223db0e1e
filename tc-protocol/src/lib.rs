//! Wire protocol between `thermctld` and its clients.
//!
//! Newline-delimited JSON: each line is a [`RequestEnvelope`] or a
//! [`ResponseEnvelope`]. Timestamps travel as milliseconds since the Unix
//! epoch, enums as lowercase strings.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global request ID counter for correlation
static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Maximum message size for IPC (8KB)
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024;

/// Maximum response size; history queries can be much larger than requests
pub const MAX_RESPONSE_SIZE: usize = 4 * 1024 * 1024;

/// Maximum readings returned by one history query (newest kept)
pub const MAX_HISTORY_POINTS: usize = 10_000;

/// Maximum identifier length (fan, sensor, operator names)
pub const MAX_IDENTIFIER_LENGTH: usize = 64;

/// Maximum free-text note length on acknowledge/resolve
pub const MAX_NOTE_LENGTH: usize = 512;

/// Maximum history window a single request may ask for (7 days)
pub const MAX_HISTORY_SPAN_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Generate a unique request ID for correlation
pub fn generate_request_id() -> u64 {
    REQUEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Unique request ID for correlation and debugging
    pub id: u64,
    /// The actual request
    #[serde(flatten)]
    pub request: Request,
}

impl RequestEnvelope {
    pub fn new(request: Request) -> Self {
        Self {
            id: generate_request_id(),
            request,
        }
    }

    pub fn with_id(request: Request, id: u64) -> Self {
        Self { id, request }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data")]
pub enum Request {
    Ping,
    Version,
    GetLatestReadings {
        #[serde(default)]
        sensor_id: Option<String>,
    },
    GetFanStates {
        #[serde(default)]
        fan_id: Option<String>,
    },
    GetAlerts {
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        severity: Option<String>,
    },
    GetHistory {
        sensor_id: String,
        since_ms: i64,
        until_ms: i64,
    },
    SetFanSpeed {
        fan_id: String,
        percent: i32,
    },
    SetFanMode {
        fan_id: String,
        mode: String,
        #[serde(default)]
        target_temp: Option<f64>,
    },
    AcknowledgeAlert {
        alert_id: String,
        who: String,
        #[serde(default)]
        note: Option<String>,
    },
    ResolveAlert {
        alert_id: String,
        who: String,
        #[serde(default)]
        note: Option<String>,
    },
    /// Push a sample from an external acquisition source
    IngestReading {
        sensor_id: String,
        value: f64,
        unit: String,
        #[serde(default)]
        location: Option<String>,
        #[serde(default)]
        timestamp_ms: Option<i64>,
    },
    ReloadConfig,
    GetStatus,
}

impl Request {
    /// Validate request shape before sending to (or dispatching inside) the daemon.
    ///
    /// Value ranges owned by the control core (speed percent, temperatures)
    /// are checked there so the caller gets the precise error kind.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Request::Ping | Request::Version | Request::ReloadConfig | Request::GetStatus => Ok(()),

            Request::GetLatestReadings { sensor_id } => {
                if let Some(id) = sensor_id {
                    validate_identifier(id)?;
                }
                Ok(())
            }

            Request::GetFanStates { fan_id } => {
                if let Some(id) = fan_id {
                    validate_identifier(id)?;
                }
                Ok(())
            }

            Request::GetAlerts { status, severity } => {
                if let Some(s) = status {
                    validate_choice(s, &["active", "acknowledged", "resolved"])?;
                }
                if let Some(s) = severity {
                    validate_choice(s, &["info", "warning", "critical"])?;
                }
                Ok(())
            }

            Request::GetHistory { sensor_id, since_ms, until_ms } => {
                validate_identifier(sensor_id)?;
                validate_time_window(*since_ms, *until_ms)
            }

            Request::SetFanSpeed { fan_id, percent: _ } => validate_identifier(fan_id),

            Request::SetFanMode { fan_id, mode, target_temp } => {
                validate_identifier(fan_id)?;
                validate_choice(mode, &["auto", "manual"])?;
                if let Some(t) = target_temp {
                    if !t.is_finite() {
                        return Err("target_temp must be a finite number".into());
                    }
                }
                Ok(())
            }

            Request::AcknowledgeAlert { alert_id, who, note }
            | Request::ResolveAlert { alert_id, who, note } => {
                validate_alert_id(alert_id)?;
                validate_identifier(who)?;
                if let Some(n) = note {
                    validate_note(n)?;
                }
                Ok(())
            }

            Request::IngestReading { sensor_id, value: _, unit, location, timestamp_ms: _ } => {
                validate_identifier(sensor_id)?;
                validate_choice(unit, &["celsius", "fahrenheit", "c", "f"])?;
                if let Some(l) = location {
                    validate_note(l)?;
                }
                Ok(())
            }
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Ping => "Ping",
            Request::Version => "Version",
            Request::GetLatestReadings { .. } => "GetLatestReadings",
            Request::GetFanStates { .. } => "GetFanStates",
            Request::GetAlerts { .. } => "GetAlerts",
            Request::GetHistory { .. } => "GetHistory",
            Request::SetFanSpeed { .. } => "SetFanSpeed",
            Request::SetFanMode { .. } => "SetFanMode",
            Request::AcknowledgeAlert { .. } => "AcknowledgeAlert",
            Request::ResolveAlert { .. } => "ResolveAlert",
            Request::IngestReading { .. } => "IngestReading",
            Request::ReloadConfig => "ReloadConfig",
            Request::GetStatus => "GetStatus",
        }
    }

    /// Whether this request mutates daemon state
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            Request::SetFanSpeed { .. }
                | Request::SetFanMode { .. }
                | Request::AcknowledgeAlert { .. }
                | Request::ResolveAlert { .. }
                | Request::IngestReading { .. }
                | Request::ReloadConfig
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Request ID this response corresponds to
    pub id: u64,
    /// The actual response
    #[serde(flatten)]
    pub response: Response,
}

impl ResponseEnvelope {
    pub fn new(id: u64, response: Response) -> Self {
        Self { id, response }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Response {
    #[serde(rename = "ok")]
    Ok(ResponseData),
    #[serde(rename = "error")]
    Error { kind: String, message: String },
}

/// Response data - each query fills exactly one field
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readings: Option<Vec<ReadingInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fans: Option<Vec<FanInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alerts: Option<Vec<AlertInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusInfo>,
}

impl ResponseData {
    pub fn none() -> Self { Self::default() }
    pub fn string(v: String) -> Self { Self { value: Some(v), ..Self::default() } }
    pub fn readings(r: Vec<ReadingInfo>) -> Self { Self { readings: Some(r), ..Self::default() } }
    pub fn fans(f: Vec<FanInfo>) -> Self { Self { fans: Some(f), ..Self::default() } }
    pub fn alerts(a: Vec<AlertInfo>) -> Self { Self { alerts: Some(a), ..Self::default() } }
    pub fn status(s: StatusInfo) -> Self { Self { status: Some(s), ..Self::default() } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingInfo {
    pub sensor_id: String,
    pub celsius: f64,
    pub location: String,
    pub status: String,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanInfo {
    pub fan_id: String,
    pub speed_percent: u8,
    pub speed_rpm: Option<u32>,
    pub control_mode: String,
    pub target_temp: Option<f64>,
    pub status: String,
    pub last_updated_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertInfo {
    pub alert_id: String,
    pub source: String,
    pub condition: String,
    pub severity: String,
    pub status: String,
    pub message: String,
    pub threshold: Option<f64>,
    pub observed: Option<f64>,
    pub occurrences: u32,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub acknowledged_at_ms: Option<i64>,
    pub acknowledged_by: Option<String>,
    pub resolved_at_ms: Option<i64>,
    pub resolved_by: Option<String>,
    pub note: Option<String>,
}

/// Control loop health summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub version: String,
    pub cycles: u64,
    pub last_cycle_ms: Option<i64>,
    pub last_cycle_duration_ms: Option<u64>,
    pub last_cycle_failures: u32,
    pub store_degraded: bool,
    pub fans: usize,
    pub sensors: usize,
    pub open_alerts: usize,
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok(ResponseData::none())
    }

    pub fn ok_string(s: impl Into<String>) -> Self {
        Response::Ok(ResponseData::string(s.into()))
    }

    pub fn error(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Response::Error {
            kind: kind.into(),
            message: msg.into(),
        }
    }
}

/// Fan, sensor and operator identifiers: `[A-Za-z0-9_.:-]`, 1..=64 chars
pub fn validate_identifier(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("Identifier cannot be empty".into());
    }

    if id.len() > MAX_IDENTIFIER_LENGTH {
        return Err(format!(
            "Identifier too long: {} > {} chars",
            id.len(),
            MAX_IDENTIFIER_LENGTH
        ));
    }

    for c in id.chars() {
        if !c.is_ascii_alphanumeric() && c != '_' && c != '-' && c != '.' && c != ':' {
            return Err(format!("Identifier contains invalid character: {:?}", c));
        }
    }

    Ok(())
}

/// Alert ids are hyphenated UUIDs
pub fn validate_alert_id(id: &str) -> Result<(), String> {
    let parts: Vec<&str> = id.split('-').collect();
    if parts.len() != 5 {
        return Err("Alert id must be a UUID".into());
    }
    let expected_lens = [8, 4, 4, 4, 12];
    for (part, &expected_len) in parts.iter().zip(expected_lens.iter()) {
        if part.len() != expected_len || !part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err("Alert id must be a UUID".into());
        }
    }
    Ok(())
}

pub fn validate_note(note: &str) -> Result<(), String> {
    if note.len() > MAX_NOTE_LENGTH {
        return Err(format!("Note too long: {} > {} chars", note.len(), MAX_NOTE_LENGTH));
    }
    if note.chars().any(|c| c.is_control() && c != ' ') {
        return Err("Note contains control characters".into());
    }
    Ok(())
}

pub fn validate_time_window(since_ms: i64, until_ms: i64) -> Result<(), String> {
    if since_ms > until_ms {
        return Err("since_ms must not be after until_ms".into());
    }
    if until_ms.saturating_sub(since_ms) > MAX_HISTORY_SPAN_MS {
        return Err(format!(
            "History window too large (maximum {} ms)",
            MAX_HISTORY_SPAN_MS
        ));
    }
    Ok(())
}

fn validate_choice(value: &str, allowed: &[&str]) -> Result<(), String> {
    let lower = value.to_ascii_lowercase();
    if allowed.contains(&lower.as_str()) {
        Ok(())
    } else {
        Err(format!("Invalid value {:?}, expected one of {:?}", value, allowed))
    }
}
