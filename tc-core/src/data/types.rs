//! Core data types for thermctl
//!
//! Sensor readings and fan state are plain data: every mutation happens in
//! the component that owns the record and hands back a fresh copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unit a raw sample was reported in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureUnit {
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    /// Convert a value in this unit to °C
    pub fn to_celsius(&self, value: f64) -> f64 {
        match self {
            TemperatureUnit::Celsius => value,
            TemperatureUnit::Fahrenheit => (value - 32.0) * 5.0 / 9.0,
        }
    }

    /// Parse a unit name (`celsius`, `fahrenheit`, `c`, `f`; case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "celsius" | "c" => Some(TemperatureUnit::Celsius),
            "fahrenheit" | "f" => Some(TemperatureUnit::Fahrenheit),
            _ => None,
        }
    }
}

/// Unvalidated sample as produced by an acquisition source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub sensor_id: String,
    pub value: f64,
    pub unit: TemperatureUnit,
    pub location: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RawSample {
    /// Celsius sample stamped with the current time
    pub fn celsius(sensor_id: impl Into<String>, value: f64) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            value,
            unit: TemperatureUnit::Celsius,
            location: None,
            timestamp: Utc::now(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Threshold classification of a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorStatus {
    Normal,
    Warning,
    Critical,
}

impl SensorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorStatus::Normal => "normal",
            SensorStatus::Warning => "warning",
            SensorStatus::Critical => "critical",
        }
    }
}

/// Validated temperature reading; `value` is always °C
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_id: String,
    pub value: f64,
    pub location: String,
    pub status: SensorStatus,
    pub timestamp: DateTime<Utc>,
}

/// Who owns a fan's speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    /// Speed owned by the control loop
    Auto,
    /// Speed owned by the operator
    Manual,
}

impl ControlMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlMode::Auto => "auto",
            ControlMode::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Some(ControlMode::Auto),
            "manual" => Some(ControlMode::Manual),
            _ => None,
        }
    }
}

/// Actuation health
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanStatus {
    Normal,
    /// Observed speed drifting from the commanded one
    Warning,
    /// Actuation failed or the fan is stuck
    Error,
}

impl FanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FanStatus::Normal => "normal",
            FanStatus::Warning => "warning",
            FanStatus::Error => "error",
        }
    }
}

/// Current and commanded state of one fan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanState {
    pub fan_id: String,
    /// Commanded speed, 0-100
    pub speed_percent: u8,
    /// Observed speed, when the hardware reports it
    pub speed_rpm: Option<u32>,
    pub control_mode: ControlMode,
    /// Target used by the evaluator in Auto mode
    pub target_temp: Option<f64>,
    pub status: FanStatus,
    pub last_updated: DateTime<Utc>,
}

impl FanState {
    /// Fresh Auto-mode state; `target_temp` overrides the policy target when set
    pub fn new(fan_id: impl Into<String>, target_temp: Option<f64>, speed_percent: u8) -> Self {
        Self {
            fan_id: fan_id.into(),
            speed_percent,
            speed_rpm: None,
            control_mode: ControlMode::Auto,
            target_temp,
            status: FanStatus::Normal,
            last_updated: Utc::now(),
        }
    }
}

/// Output of the policy evaluator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FanCommand {
    NoChange,
    SetSpeed(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fahrenheit_conversion() {
        assert!((TemperatureUnit::Fahrenheit.to_celsius(212.0) - 100.0).abs() < 1e-9);
        assert!((TemperatureUnit::Fahrenheit.to_celsius(-40.0) + 40.0).abs() < 1e-9);
        assert_eq!(TemperatureUnit::Celsius.to_celsius(42.5), 42.5);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!(TemperatureUnit::parse("F"), Some(TemperatureUnit::Fahrenheit));
        assert_eq!(TemperatureUnit::parse("kelvin"), None);
        assert_eq!(ControlMode::parse("Manual"), Some(ControlMode::Manual));
        assert_eq!(ControlMode::parse("off"), None);
    }

    #[test]
    fn test_status_ordering() {
        assert!(SensorStatus::Critical > SensorStatus::Warning);
        assert!(FanStatus::Error > FanStatus::Normal);
    }
}
