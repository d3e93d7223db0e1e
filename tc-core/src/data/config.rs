//! Control policy configuration
//!
//! The control core receives a fully parsed [`ControlPolicyConfig`]. It is
//! validated once when it enters the system (startup or explicit reload) and
//! is immutable for the duration of a control cycle.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{health, limits, policy, speed};
use crate::data::validation::{validate_config_identifier, validate_temperature};
use tc_error::{Result, ThermalError};

/// Per-fan control parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanPolicy {
    pub fan_id: String,
    /// Sensors driving this fan; the hottest one wins
    #[serde(default)]
    pub sensor_ids: Vec<String>,
    pub target_temp: f64,
    #[serde(default = "default_proportional_band")]
    pub proportional_band: f64,
    #[serde(default = "default_min_speed")]
    pub min_speed_percent: u8,
    #[serde(default = "default_max_speed")]
    pub max_speed_percent: u8,
    #[serde(default = "default_hysteresis_band")]
    pub hysteresis_band: f64,
    /// Full-speed RPM; enables stuck/mismatch detection when set
    #[serde(default)]
    pub max_rpm: Option<u32>,
}

fn default_proportional_band() -> f64 {
    policy::DEFAULT_PROPORTIONAL_BAND
}

fn default_min_speed() -> u8 {
    policy::DEFAULT_MIN_SPEED_PERCENT
}

fn default_max_speed() -> u8 {
    policy::DEFAULT_MAX_SPEED_PERCENT
}

fn default_hysteresis_band() -> f64 {
    policy::DEFAULT_HYSTERESIS_BAND
}

impl FanPolicy {
    /// Policy with default band, hysteresis and speed limits
    pub fn new(fan_id: impl Into<String>, sensor_ids: Vec<String>, target_temp: f64) -> Self {
        Self {
            fan_id: fan_id.into(),
            sensor_ids,
            target_temp,
            proportional_band: policy::DEFAULT_PROPORTIONAL_BAND,
            min_speed_percent: policy::DEFAULT_MIN_SPEED_PERCENT,
            max_speed_percent: policy::DEFAULT_MAX_SPEED_PERCENT,
            hysteresis_band: policy::DEFAULT_HYSTERESIS_BAND,
            max_rpm: None,
        }
    }

    fn validate(&self, index: usize) -> Result<()> {
        let field = |name: &str| format!("fans[{}].{}", index, name);

        validate_config_identifier(&field("fan_id"), &self.fan_id)?;
        for (i, sensor_id) in self.sensor_ids.iter().enumerate() {
            validate_config_identifier(&field(&format!("sensor_ids[{}]", i)), sensor_id)?;
        }

        validate_temperature(&field("target_temp"), self.target_temp)
            .map_err(|e| ThermalError::invalid_config(field("target_temp"), e.to_string()))?;

        if !self.proportional_band.is_finite() || self.proportional_band <= 0.0 {
            return Err(ThermalError::invalid_config(
                field("proportional_band"),
                format!("must be > 0, got {}", self.proportional_band),
            ));
        }

        if !self.hysteresis_band.is_finite() || self.hysteresis_band < 0.0 {
            return Err(ThermalError::invalid_config(
                field("hysteresis_band"),
                format!("must be >= 0, got {}", self.hysteresis_band),
            ));
        }

        if self.max_speed_percent > speed::MAX_PERCENT {
            return Err(ThermalError::invalid_config(
                field("max_speed_percent"),
                format!("must be <= {}, got {}", speed::MAX_PERCENT, self.max_speed_percent),
            ));
        }

        if self.min_speed_percent > self.max_speed_percent {
            return Err(ThermalError::invalid_config(
                field("min_speed_percent"),
                format!(
                    "must be <= max_speed_percent ({}), got {}",
                    self.max_speed_percent, self.min_speed_percent
                ),
            ));
        }

        if self.max_rpm == Some(0) {
            return Err(ThermalError::invalid_config(field("max_rpm"), "must be > 0 when set"));
        }

        Ok(())
    }
}

/// Warning/critical limits for one sensor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorThresholds {
    pub warning_threshold: f64,
    pub critical_threshold: f64,
}

/// Per-sensor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorPolicy {
    pub sensor_id: String,
    /// Display/diagnostic descriptor used when a sample carries none
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub thresholds: Option<SensorThresholds>,
}

impl SensorPolicy {
    fn validate(&self, index: usize) -> Result<()> {
        validate_config_identifier(&format!("sensors[{}].sensor_id", index), &self.sensor_id)?;

        if let Some(t) = &self.thresholds {
            let field = format!("sensors[{}].thresholds", index);
            for value in [t.warning_threshold, t.critical_threshold] {
                validate_temperature(&field, value)
                    .map_err(|e| ThermalError::invalid_config(&field, e.to_string()))?;
            }
            if t.warning_threshold >= t.critical_threshold {
                return Err(ThermalError::invalid_config(
                    field,
                    format!(
                        "warning_threshold ({}) must be below critical_threshold ({})",
                        t.warning_threshold, t.critical_threshold
                    ),
                ));
            }
        }

        Ok(())
    }
}

/// Full control policy snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPolicyConfig {
    #[serde(default)]
    pub fans: Vec<FanPolicy>,
    #[serde(default)]
    pub sensors: Vec<SensorPolicy>,
    /// Readings older than this are treated as missing input
    #[serde(default)]
    pub max_reading_age_secs: Option<u64>,
    #[serde(default = "default_rpm_tolerance")]
    pub rpm_tolerance_percent: f64,
    #[serde(default = "default_mismatch_cycles")]
    pub mismatch_cycles: u32,
}

fn default_rpm_tolerance() -> f64 {
    health::DEFAULT_RPM_TOLERANCE_PERCENT
}

fn default_mismatch_cycles() -> u32 {
    health::DEFAULT_MISMATCH_CYCLES
}

impl Default for ControlPolicyConfig {
    fn default() -> Self {
        Self {
            fans: Vec::new(),
            sensors: Vec::new(),
            max_reading_age_secs: None,
            rpm_tolerance_percent: health::DEFAULT_RPM_TOLERANCE_PERCENT,
            mismatch_cycles: health::DEFAULT_MISMATCH_CYCLES,
        }
    }
}

impl ControlPolicyConfig {
    /// Reject anything that must never reach a running policy
    pub fn validate(&self) -> Result<()> {
        if self.fans.len() > limits::MAX_FANS {
            return Err(ThermalError::invalid_config(
                "fans",
                format!("at most {} fans supported", limits::MAX_FANS),
            ));
        }
        if self.sensors.len() > limits::MAX_SENSORS {
            return Err(ThermalError::invalid_config(
                "sensors",
                format!("at most {} sensors supported", limits::MAX_SENSORS),
            ));
        }

        let mut fan_ids = HashSet::new();
        for (i, fan) in self.fans.iter().enumerate() {
            fan.validate(i)?;
            if !fan_ids.insert(fan.fan_id.as_str()) {
                return Err(ThermalError::invalid_config(
                    format!("fans[{}].fan_id", i),
                    format!("duplicate fan id '{}'", fan.fan_id),
                ));
            }
        }

        let mut sensor_ids = HashSet::new();
        for (i, sensor) in self.sensors.iter().enumerate() {
            sensor.validate(i)?;
            if !sensor_ids.insert(sensor.sensor_id.as_str()) {
                return Err(ThermalError::invalid_config(
                    format!("sensors[{}].sensor_id", i),
                    format!("duplicate sensor id '{}'", sensor.sensor_id),
                ));
            }
        }

        if self.max_reading_age_secs == Some(0) {
            return Err(ThermalError::invalid_config("max_reading_age_secs", "must be > 0 when set"));
        }

        if !self.rpm_tolerance_percent.is_finite()
            || !(0.0..=100.0).contains(&self.rpm_tolerance_percent)
        {
            return Err(ThermalError::invalid_config(
                "rpm_tolerance_percent",
                format!("must be 0-100, got {}", self.rpm_tolerance_percent),
            ));
        }

        if self.mismatch_cycles == 0 {
            return Err(ThermalError::invalid_config("mismatch_cycles", "must be >= 1"));
        }

        Ok(())
    }

    pub fn fan(&self, fan_id: &str) -> Option<&FanPolicy> {
        self.fans.iter().find(|f| f.fan_id == fan_id)
    }

    pub fn sensor(&self, sensor_id: &str) -> Option<&SensorPolicy> {
        self.sensors.iter().find(|s| s.sensor_id == sensor_id)
    }

    pub fn thresholds(&self, sensor_id: &str) -> Option<SensorThresholds> {
        self.sensor(sensor_id).and_then(|s| s.thresholds)
    }

    pub fn max_reading_age(&self) -> Option<Duration> {
        self.max_reading_age_secs.map(Duration::from_secs)
    }

    /// Every sensor id that is configured or bound to a fan, deduplicated, in config order
    pub fn all_sensor_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.sensors
            .iter()
            .map(|s| s.sensor_id.as_str())
            .chain(self.fans.iter().flat_map(|f| f.sensor_ids.iter().map(String::as_str)))
            .filter(|id| seen.insert(*id))
            .map(str::to_string)
            .collect()
    }
}
