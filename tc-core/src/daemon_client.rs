//! Daemon Client
//!
//! Blocking client for the `thermctld` Unix socket. Used by the CLI and by
//! external acquisition sources pushing readings.

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tc_error::{Result, ThermalError};
use tc_protocol::{
    AlertInfo, FanInfo, ReadingInfo, Request, RequestEnvelope, Response, ResponseData,
    ResponseEnvelope, StatusInfo, MAX_MESSAGE_SIZE, MAX_RESPONSE_SIZE,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Initial buffer size for responses
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Connection to the daemon
pub struct DaemonClient {
    socket_path: PathBuf,
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

impl DaemonClient {
    pub fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let stream = UnixStream::connect(&socket_path).map_err(|e| {
            ThermalError::DaemonConnection(format!("failed to connect to {}: {}", socket_path.display(), e))
        })?;

        let reader_stream = stream
            .try_clone()
            .map_err(|e| ThermalError::DaemonConnection(format!("failed to clone socket: {}", e)))?;

        for s in [&stream, &reader_stream] {
            s.set_read_timeout(Some(TIMEOUT))?;
            s.set_write_timeout(Some(TIMEOUT))?;
        }

        Ok(Self {
            socket_path,
            writer: stream,
            reader: BufReader::new(reader_stream),
        })
    }

    /// Send a request and wait for its response (reconnects once on I/O failure)
    pub fn request(&mut self, req: Request) -> Result<ResponseData> {
        match self.request_with_retry(&req, true)? {
            Response::Ok(data) => Ok(data),
            Response::Error { kind, message } => {
                Err(ThermalError::DaemonResponse(format!("{}: {}", kind, message)))
            }
        }
    }

    fn request_with_retry(&mut self, req: &Request, allow_retry: bool) -> Result<Response> {
        req.validate()
            .map_err(|e| ThermalError::IpcProtocol(format!("invalid {} request: {}", req.type_name(), e)))?;

        let request_id = tc_protocol::generate_request_id();
        let envelope = RequestEnvelope::with_id(req.clone(), request_id);

        let mut json = serde_json::to_vec(&envelope)?;
        json.push(b'\n');

        if json.len() > MAX_MESSAGE_SIZE {
            return Err(ThermalError::MessageTooLarge {
                size: json.len(),
                max_size: MAX_MESSAGE_SIZE,
            });
        }

        if let Err(e) = self.writer.write_all(&json) {
            if allow_retry {
                *self = Self::connect(&self.socket_path)?;
                return self.request_with_retry(req, false);
            }
            return Err(ThermalError::DaemonConnection(format!("failed to send request: {}", e)));
        }

        let mut response_buf: Vec<u8> = Vec::with_capacity(INITIAL_BUFFER_SIZE);
        let read = (&mut self.reader)
            .take(MAX_RESPONSE_SIZE as u64 + 1)
            .read_until(b'\n', &mut response_buf);
        if let Err(e) = read {
            if allow_retry {
                *self = Self::connect(&self.socket_path)?;
                return self.request_with_retry(req, false);
            }
            return Err(ThermalError::DaemonConnection(format!("failed to read response: {}", e)));
        }

        if response_buf.is_empty() {
            return Err(ThermalError::DaemonConnection("daemon closed connection".to_string()));
        }

        if response_buf.len() > MAX_RESPONSE_SIZE {
            return Err(ThermalError::MessageTooLarge {
                size: response_buf.len(),
                max_size: MAX_RESPONSE_SIZE,
            });
        }

        if response_buf.last() == Some(&b'\n') {
            response_buf.pop();
        }

        let response: ResponseEnvelope = serde_json::from_slice(&response_buf)
            .map_err(|e| ThermalError::IpcProtocol(format!("failed to parse response: {}", e)))?;

        if response.id != request_id {
            return Err(ThermalError::IpcProtocol(format!(
                "response id mismatch: expected {}, got {}",
                request_id, response.id
            )));
        }

        Ok(response.response)
    }

    pub fn ping(&mut self) -> Result<()> {
        self.request(Request::Ping).map(|_| ())
    }

    pub fn version(&mut self) -> Result<String> {
        let data = self.request(Request::Version)?;
        expect(data.value, "value")
    }

    pub fn latest_readings(&mut self, sensor_id: Option<String>) -> Result<Vec<ReadingInfo>> {
        let data = self.request(Request::GetLatestReadings { sensor_id })?;
        expect(data.readings, "readings")
    }

    pub fn fan_states(&mut self, fan_id: Option<String>) -> Result<Vec<FanInfo>> {
        let data = self.request(Request::GetFanStates { fan_id })?;
        expect(data.fans, "fans")
    }

    pub fn alerts(&mut self, status: Option<String>, severity: Option<String>) -> Result<Vec<AlertInfo>> {
        let data = self.request(Request::GetAlerts { status, severity })?;
        expect(data.alerts, "alerts")
    }

    pub fn history(&mut self, sensor_id: String, since_ms: i64, until_ms: i64) -> Result<Vec<ReadingInfo>> {
        let data = self.request(Request::GetHistory { sensor_id, since_ms, until_ms })?;
        expect(data.readings, "readings")
    }

    pub fn set_fan_speed(&mut self, fan_id: String, percent: i32) -> Result<FanInfo> {
        let data = self.request(Request::SetFanSpeed { fan_id, percent })?;
        first(data.fans, "fans")
    }

    pub fn set_fan_mode(&mut self, fan_id: String, mode: String, target_temp: Option<f64>) -> Result<FanInfo> {
        let data = self.request(Request::SetFanMode { fan_id, mode, target_temp })?;
        first(data.fans, "fans")
    }

    pub fn acknowledge_alert(&mut self, alert_id: String, who: String, note: Option<String>) -> Result<AlertInfo> {
        let data = self.request(Request::AcknowledgeAlert { alert_id, who, note })?;
        first(data.alerts, "alerts")
    }

    pub fn resolve_alert(&mut self, alert_id: String, who: String, note: Option<String>) -> Result<AlertInfo> {
        let data = self.request(Request::ResolveAlert { alert_id, who, note })?;
        first(data.alerts, "alerts")
    }

    pub fn ingest(
        &mut self,
        sensor_id: String,
        value: f64,
        unit: String,
        location: Option<String>,
        timestamp_ms: Option<i64>,
    ) -> Result<ReadingInfo> {
        let data = self.request(Request::IngestReading { sensor_id, value, unit, location, timestamp_ms })?;
        first(data.readings, "readings")
    }

    pub fn reload_config(&mut self) -> Result<String> {
        let data = self.request(Request::ReloadConfig)?;
        expect(data.value, "value")
    }

    pub fn status(&mut self) -> Result<StatusInfo> {
        let data = self.request(Request::GetStatus)?;
        expect(data.status, "status")
    }
}

fn expect<T>(field: Option<T>, name: &str) -> Result<T> {
    field.ok_or_else(|| ThermalError::IpcProtocol(format!("response is missing '{}'", name)))
}

fn first<T>(field: Option<Vec<T>>, name: &str) -> Result<T> {
    expect(field, name)?
        .into_iter()
        .next()
        .ok_or_else(|| ThermalError::IpcProtocol(format!("response '{}' is empty", name)))
}

/// Check if the daemon socket exists
pub fn is_daemon_available(socket_path: impl AsRef<Path>) -> bool {
    socket_path.as_ref().exists()
}
