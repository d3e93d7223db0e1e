//! thermctl Core Library
//!
//! Closed-loop thermal control: ingest temperature samples, keep a per-sensor
//! history, compute fan speeds from a proportional band with hysteresis,
//! drive fans and track alerts.
//!
//! # Module Structure
//!
//! - `data/` - Data types, policy configuration, validation, state snapshots
//! - `engine/` - Pure policy evaluator
//! - `ingest` / `history` - Sample validation and the history store seam
//! - `actuator` - Fan state ownership and the hardware driver seam
//! - `alerts` - Alert state machine and notification sink
//! - `controller` - Control cycle and the query/command interface
//!
//! # Example
//!
//! ```no_run
//! use tc_core::{evaluate, FanPolicy, FanState, FanCommand};
//!
//! let policy = FanPolicy::new("CPU_FAN_1", vec!["CPU_TEMP_1".into()], 65.0);
//! let fan = FanState::new("CPU_FAN_1", None, 50);
//! assert_eq!(evaluate(&fan, Some(85.0), &policy), FanCommand::SetSpeed(100));
//! ```

// Grouped modules
pub mod data;
pub mod engine;

// Standalone modules
pub mod actuator;
pub mod alerts;
pub mod constants;
pub mod controller;
pub mod daemon_client;
pub mod history;
pub mod ingest;

// Re-export primary types from data/
pub use data::{
    ControlMode, ControlPolicyConfig, FanCommand, FanPolicy, FanState, FanStatus, RawSample,
    SensorPolicy, SensorReading, SensorStatus, SensorThresholds, TemperatureUnit,
};

// Re-export persistence from data/
pub use data::{load_snapshot, save_snapshot, StateSnapshot};

// Re-export validation functions from data/
pub use data::{
    validate_config_identifier, validate_identifier, validate_speed_percent, validate_temperature,
};

pub use actuator::{FanActuator, FanDriver, FanHandle, HealthPolicy};
pub use alerts::{
    Alert, AlertCondition, AlertEvent, AlertManager, AlertSeverity, AlertSink, AlertStatus,
    AlertTrigger, TracingAlertSink,
};
pub use controller::{ControllerOptions, ControllerStatus, CycleReport, FanReport, ThermalController};
pub use daemon_client::DaemonClient;
pub use engine::{combine_inputs, evaluate, evaluate_fan};
pub use history::{HistoryStore, InMemoryHistoryStore, ReadingIter};
pub use ingest::Ingestor;

pub use tc_error::{ErrorKind, Result, ThermalError};
