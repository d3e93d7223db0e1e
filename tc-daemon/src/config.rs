//! Daemon configuration file
//!
//! One JSON document holds the control policy, the hardware bindings that
//! map fan and sensor ids to sysfs files, and the daemon's own timing.
//! It is read at startup and again on `ReloadConfig`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tc_core::constants::{paths, speed, timing};
use tc_core::data::validate_file_size;
use tc_core::{validate_config_identifier, ControlPolicyConfig, ControllerOptions};
use tc_error::{Result, ThermalError};

/// Default full-scale PWM value for hwmon
pub const DEFAULT_PWM_MAX: u8 = speed::PWM_MAX;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanBinding {
    pub fan_id: String,
    /// hwmon `pwmN` file
    pub pwm_path: PathBuf,
    /// hwmon `fanN_input` file, if the fan reports RPM
    #[serde(default)]
    pub rpm_path: Option<PathBuf>,
    #[serde(default = "default_pwm_max")]
    pub pwm_max: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorBinding {
    pub sensor_id: String,
    /// File holding millidegrees Celsius (hwmon `tempN_input`, thermal zone `temp`)
    pub source_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfig {
    #[serde(default)]
    pub fans: Vec<FanBinding>,
    #[serde(default)]
    pub sensors: Vec<SensorBinding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// Fan/alert snapshot; `null` disables persistence
    #[serde(default = "default_state_path")]
    pub state_path: Option<PathBuf>,
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_sensor_poll_interval_ms")]
    pub sensor_poll_interval_ms: u64,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
    #[serde(default)]
    pub hardware: HardwareConfig,
    pub policy: ControlPolicyConfig,
}

fn default_pwm_max() -> u8 {
    DEFAULT_PWM_MAX
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(paths::DEFAULT_SOCKET_PATH)
}

fn default_state_path() -> Option<PathBuf> {
    Some(PathBuf::from(paths::DEFAULT_STATE_PATH))
}

fn default_cycle_interval_ms() -> u64 {
    timing::DEFAULT_CYCLE_INTERVAL.as_millis() as u64
}

fn default_operation_timeout_ms() -> u64 {
    timing::DEFAULT_OPERATION_TIMEOUT.as_millis() as u64
}

fn default_sensor_poll_interval_ms() -> u64 {
    timing::DEFAULT_SENSOR_POLL_INTERVAL.as_millis() as u64
}

fn default_retention_secs() -> u64 {
    timing::DEFAULT_RETENTION.as_secs()
}

fn default_prune_interval_secs() -> u64 {
    timing::DEFAULT_PRUNE_INTERVAL.as_secs()
}

impl DaemonConfig {
    /// Read, parse and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        validate_file_size(path)?;

        let content = std::fs::read_to_string(path).map_err(|e| ThermalError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: DaemonConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;

        if !self.socket_path.is_absolute() {
            return Err(ThermalError::invalid_config("socket_path", "must be an absolute path"));
        }

        let min_ms = timing::MIN_INTERVAL.as_millis() as u64;
        for (field, value) in [
            ("cycle_interval_ms", self.cycle_interval_ms),
            ("operation_timeout_ms", self.operation_timeout_ms),
            ("sensor_poll_interval_ms", self.sensor_poll_interval_ms),
        ] {
            if value < min_ms {
                return Err(ThermalError::invalid_config(field, format!("must be at least {} ms", min_ms)));
            }
        }
        if self.operation_timeout_ms >= self.cycle_interval_ms {
            return Err(ThermalError::invalid_config(
                "operation_timeout_ms",
                "must be shorter than cycle_interval_ms",
            ));
        }
        if self.retention_secs == 0 {
            return Err(ThermalError::invalid_config("retention_secs", "must be positive"));
        }
        if self.prune_interval_secs == 0 {
            return Err(ThermalError::invalid_config("prune_interval_secs", "must be positive"));
        }

        let mut seen = HashSet::new();
        for (i, fan) in self.hardware.fans.iter().enumerate() {
            let field = format!("hardware.fans[{}]", i);
            validate_config_identifier(&format!("{}.fan_id", field), &fan.fan_id)?;
            if !seen.insert(fan.fan_id.as_str()) {
                return Err(ThermalError::invalid_config(field, format!("duplicate fan_id '{}'", fan.fan_id)));
            }
            if self.policy.fan(&fan.fan_id).is_none() {
                return Err(ThermalError::invalid_config(
                    field,
                    format!("fan '{}' has no policy entry", fan.fan_id),
                ));
            }
            if fan.pwm_max == 0 {
                return Err(ThermalError::invalid_config(field + ".pwm_max", "must be positive"));
            }
        }

        let mut seen = HashSet::new();
        for (i, sensor) in self.hardware.sensors.iter().enumerate() {
            let field = format!("hardware.sensors[{}].sensor_id", i);
            validate_config_identifier(&field, &sensor.sensor_id)?;
            if !seen.insert(sensor.sensor_id.as_str()) {
                return Err(ThermalError::invalid_config(
                    format!("hardware.sensors[{}]", i),
                    format!("duplicate sensor_id '{}'", sensor.sensor_id),
                ));
            }
        }

        Ok(())
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
            cycle_deadline: self.cycle_interval(),
            snapshot_path: self.state_path.clone(),
        }
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn sensor_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sensor_poll_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
        "socket_path": "/run/thermctl/test.sock",
        "state_path": null,
        "hardware": {
            "fans": [{ "fan_id": "CPU_FAN_1", "pwm_path": "/sys/class/hwmon/hwmon2/pwm1", "rpm_path": "/sys/class/hwmon/hwmon2/fan1_input" }],
            "sensors": [{ "sensor_id": "CPU_TEMP_1", "source_path": "/sys/class/hwmon/hwmon2/temp1_input" }]
        },
        "policy": {
            "fans": [{ "fan_id": "CPU_FAN_1", "sensor_ids": ["CPU_TEMP_1"], "target_temp": 65.0 }]
        }
    }"#;

    fn write(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("config.json");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_with_defaults() {
        let dir = TempDir::new().unwrap();
        let config = DaemonConfig::load(&write(&dir, SAMPLE)).unwrap();

        assert_eq!(config.state_path, None);
        assert_eq!(config.cycle_interval(), timing::DEFAULT_CYCLE_INTERVAL);
        assert_eq!(config.hardware.fans[0].pwm_max, DEFAULT_PWM_MAX);
        assert_eq!(config.policy.fans[0].max_speed_percent, 100);
        assert!(config.controller_options().snapshot_path.is_none());
    }

    #[test]
    fn test_binding_without_policy_rejected() {
        let dir = TempDir::new().unwrap();
        let content = SAMPLE.replace(r#""fan_id": "CPU_FAN_1", "pwm_path""#, r#""fan_id": "SYS_FAN_9", "pwm_path""#);
        let err = DaemonConfig::load(&write(&dir, &content)).unwrap_err();
        assert!(matches!(err, ThermalError::InvalidConfig { .. }));
    }

    #[test]
    fn test_padded_binding_id_rejected() {
        let dir = TempDir::new().unwrap();
        let content = SAMPLE.replace(r#""sensor_id": "CPU_TEMP_1", "source_path""#, r#""sensor_id": "CPU_TEMP_1 ", "source_path""#);
        let err = DaemonConfig::load(&write(&dir, &content)).unwrap_err();
        assert!(matches!(err, ThermalError::InvalidConfig { ref field, .. } if field == "hardware.sensors[0].sensor_id"));
    }

    #[test]
    fn test_timeout_must_fit_in_cycle() {
        let dir = TempDir::new().unwrap();
        let content = SAMPLE.replace(r#""state_path": null,"#, r#""state_path": null, "cycle_interval_ms": 500, "operation_timeout_ms": 800,"#);
        let err = DaemonConfig::load(&write(&dir, &content)).unwrap_err();
        assert!(err.to_string().contains("operation_timeout_ms"));
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let dir = TempDir::new().unwrap();
        let content = SAMPLE.replace(r#""target_temp": 65.0"#, r#""target_temp": 65.0, "proportional_band": 0.0"#);
        assert!(DaemonConfig::load(&write(&dir, &content)).is_err());
    }

    #[test]
    fn test_malformed_json() {
        let dir = TempDir::new().unwrap();
        let err = DaemonConfig::load(&write(&dir, "{ not json")).unwrap_err();
        assert!(matches!(err, ThermalError::JsonParse(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = DaemonConfig::load(Path::new("/nonexistent/thermctl.json")).unwrap_err();
        assert_eq!(err.kind(), tc_error::ErrorKind::Internal);
    }
}
