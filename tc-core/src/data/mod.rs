//! Data types, policy configuration, validation and persistence
//!
//! Contains the plain data records shared by every control component.

mod config;
mod persistence;
mod types;
mod validation;

pub use config::{ControlPolicyConfig, FanPolicy, SensorPolicy, SensorThresholds};
pub use persistence::{load_snapshot, save_snapshot, StateSnapshot, SNAPSHOT_VERSION};
pub use types::{
    ControlMode, FanCommand, FanState, FanStatus, RawSample, SensorReading, SensorStatus,
    TemperatureUnit,
};
pub use validation::{
    validate_config_identifier, validate_file_size, validate_identifier, validate_speed_percent,
    validate_temperature,
};
