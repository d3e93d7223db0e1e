//! Constants and configuration defaults for thermctl
//!
//! Centralizes magic numbers and defaults. Add new ones here rather than
//! scattering literals through the control code.

use std::time::Duration;

/// Temperature limits and conversions
pub mod temperature {
    /// Lowest plausible sensor value in °C; anything below is rejected
    pub const PHYSICAL_MIN_CELSIUS: f64 = -40.0;

    /// Highest plausible sensor value in °C; anything above is rejected
    pub const PHYSICAL_MAX_CELSIUS: f64 = 150.0;

    /// Divisor for hwmon millidegree values
    pub const MILLIDEGREE_DIVISOR: f64 = 1000.0;
}

/// Fan speed range
pub mod speed {
    pub const MIN_PERCENT: u8 = 0;
    pub const MAX_PERCENT: u8 = 100;

    /// Standard Linux hwmon PWM duty range
    pub const PWM_MAX: u8 = 255;
}

/// Control policy defaults
pub mod policy {
    /// °C span over which speed scales from min to max
    pub const DEFAULT_PROPORTIONAL_BAND: f64 = 20.0;

    /// °C dead zone around target (±half on each side)
    pub const DEFAULT_HYSTERESIS_BAND: f64 = 4.0;

    pub const DEFAULT_MIN_SPEED_PERCENT: u8 = 20;
    pub const DEFAULT_MAX_SPEED_PERCENT: u8 = 100;
}

/// Actuation health tracking defaults
pub mod health {
    /// Allowed deviation between commanded and observed speed, as % of max RPM
    pub const DEFAULT_RPM_TOLERANCE_PERCENT: f64 = 25.0;

    /// Consecutive mismatching observations before a fan is marked Error
    pub const DEFAULT_MISMATCH_CYCLES: u32 = 3;
}

/// Timing values for the control loop and its collaborators
pub mod timing {
    use super::Duration;

    /// Default control cycle interval
    pub const DEFAULT_CYCLE_INTERVAL: Duration = Duration::from_secs(2);

    /// Default per-operation deadline for history and hardware I/O
    pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(500);

    /// Default history retention window
    pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

    /// Default interval between retention sweeps
    pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

    /// Default sensor polling interval
    pub const DEFAULT_SENSOR_POLL_INTERVAL: Duration = Duration::from_secs(1);

    /// How far ahead of the local clock a sample timestamp may be
    pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(5);

    /// Lower bound for any configured interval
    pub const MIN_INTERVAL: Duration = Duration::from_millis(50);
}

/// Resource limits
pub mod limits {
    /// Maximum identifier length for fans and sensors
    pub const MAX_IDENTIFIER_LEN: usize = tc_protocol::MAX_IDENTIFIER_LENGTH;

    /// Maximum stored points per sensor in the in-memory history store
    pub const MAX_POINTS_PER_SENSOR: usize = 86_400;

    /// Resolved alerts kept before the oldest are dropped
    pub const MAX_RESOLVED_ALERTS: usize = 1000;

    /// Maximum size of a config or state file (1 MB)
    pub const MAX_FILE_SIZE: u64 = 1024 * 1024;

    /// Maximum fans in one policy
    pub const MAX_FANS: usize = 64;

    /// Maximum sensors in one policy
    pub const MAX_SENSORS: usize = 256;

    /// Repeated failures are logged on the first occurrence and then every N
    pub const MAX_CONSECUTIVE_ERRORS: u32 = 10;
}

/// Default filesystem locations
pub mod paths {
    pub const DEFAULT_SOCKET_PATH: &str = "/run/thermctl/thermctld.sock";
    pub const DEFAULT_CONFIG_PATH: &str = "/etc/thermctl/config.json";
    pub const DEFAULT_STATE_PATH: &str = "/var/lib/thermctl/state.json";
    pub const DEFAULT_PID_FILE: &str = "/run/thermctl/thermctld.pid";
}

/// Well-known alert sources that are not sensors or fans
pub mod sources {
    /// Source id used for alerts raised about the control loop itself
    pub const CONTROL_LOOP: &str = "control-loop";
}
