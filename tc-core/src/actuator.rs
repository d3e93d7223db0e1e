//! Fan actuator
//!
//! Owns exactly one [`FanState`] per fan id. All mutation goes through a
//! [`FanHandle`], which holds that fan's lock for the duration of one control
//! operation, so at most one operation per fan is in flight at any time.
//!
//! Hardware access goes through the blocking [`FanDriver`] seam, run on the
//! blocking pool under a per-operation deadline. A failed or timed-out write
//! marks the fan `Error`; observed RPM drifting away from the commanded speed
//! moves it to `Warning` and then `Error` after enough consecutive cycles.
//!
//! Readers never wait on hardware: every mutation publishes a copy of the
//! state, and queries read the published copies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::constants::{health, timing};
use crate::data::{
    validate_speed_percent, validate_temperature, ControlMode, ControlPolicyConfig, FanCommand,
    FanState, FanStatus,
};
use tc_error::{Result, ThermalError};

/// Blocking access to fan hardware
pub trait FanDriver: Send + Sync {
    /// Command a speed in percent (0-100)
    fn write_speed(&self, fan_id: &str, percent: u8) -> Result<()>;

    /// Observed speed; `None` when the fan has no tachometer
    fn read_rpm(&self, fan_id: &str) -> Result<Option<u32>>;
}

/// Mismatch detection parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthPolicy {
    pub rpm_tolerance_percent: f64,
    pub mismatch_cycles: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            rpm_tolerance_percent: health::DEFAULT_RPM_TOLERANCE_PERCENT,
            mismatch_cycles: health::DEFAULT_MISMATCH_CYCLES,
        }
    }
}

impl HealthPolicy {
    fn from_config(config: &ControlPolicyConfig) -> Self {
        Self {
            rpm_tolerance_percent: config.rpm_tolerance_percent,
            mismatch_cycles: config.mismatch_cycles,
        }
    }
}

struct FanSlot {
    state: FanState,
    max_rpm: Option<u32>,
    /// Consecutive observations outside tolerance
    mismatches: u32,
    write_failed: bool,
}

impl FanSlot {
    fn new(fan_id: &str, speed_percent: u8, max_rpm: Option<u32>) -> Self {
        Self {
            state: FanState::new(fan_id, None, speed_percent),
            max_rpm,
            mismatches: 0,
            write_failed: false,
        }
    }

    fn derive_status(&self, mismatch_cycles: u32) -> FanStatus {
        if self.write_failed || self.mismatches >= mismatch_cycles {
            FanStatus::Error
        } else if self.mismatches > 0 {
            FanStatus::Warning
        } else {
            FanStatus::Normal
        }
    }
}

/// Owns fan state and drives the hardware
pub struct FanActuator {
    slots: RwLock<HashMap<String, Arc<Mutex<FanSlot>>>>,
    published: RwLock<HashMap<String, FanState>>,
    driver: Arc<dyn FanDriver>,
    timeout: Duration,
    health: RwLock<HealthPolicy>,
}

impl FanActuator {
    pub fn new(driver: Arc<dyn FanDriver>) -> Self {
        Self::with_timeout(driver, timing::DEFAULT_OPERATION_TIMEOUT)
    }

    /// Actuator abandoning driver calls after `timeout`
    pub fn with_timeout(driver: Arc<dyn FanDriver>, timeout: Duration) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            published: RwLock::new(HashMap::new()),
            driver,
            timeout,
            health: RwLock::new(HealthPolicy::default()),
        }
    }

    /// Register configured fans, forget removed ones and refresh health limits
    ///
    /// New fans start in Auto mode at their maximum speed until the first
    /// cycle or [`FanActuator::initialize`] drives them.
    pub async fn reconcile(&self, config: &ControlPolicyConfig) {
        *self.health.write() = HealthPolicy::from_config(config);

        let existing: Vec<(String, Arc<Mutex<FanSlot>>)> = {
            let mut slots = self.slots.write();
            let mut published = self.published.write();

            slots.retain(|id, _| config.fan(id).is_some());
            published.retain(|id, _| config.fan(id).is_some());

            for fan in &config.fans {
                if !slots.contains_key(&fan.fan_id) {
                    let slot = FanSlot::new(&fan.fan_id, fan.max_speed_percent, fan.max_rpm);
                    published.insert(fan.fan_id.clone(), slot.state.clone());
                    slots.insert(fan.fan_id.clone(), Arc::new(Mutex::new(slot)));
                    debug!(fan = %fan.fan_id, "Registered fan");
                }
            }

            slots.iter().map(|(id, s)| (id.clone(), s.clone())).collect()
        };

        for (fan_id, slot) in existing {
            let max_rpm = config.fan(&fan_id).and_then(|f| f.max_rpm);
            let mut slot = slot.lock().await;
            if slot.max_rpm != max_rpm {
                slot.max_rpm = max_rpm;
                slot.mismatches = 0;
            }
        }
    }

    /// Carry persisted mode, speed and target over to configured fans
    pub async fn restore(&self, states: Vec<FanState>) {
        for saved in states {
            let Ok(mut handle) = self.lock(&saved.fan_id).await else {
                debug!(fan = %saved.fan_id, "Ignoring persisted state for unconfigured fan");
                continue;
            };
            let state = &mut handle.slot.state;
            state.control_mode = saved.control_mode;
            state.speed_percent = saved.speed_percent.min(100);
            state.target_temp = saved.target_temp;
            handle.publish();
            debug!(fan = %saved.fan_id, mode = saved.control_mode.as_str(), "Restored fan state");
        }
    }

    /// Boot fail-safe: Auto fans to max speed, Manual fans to their operator speed
    pub async fn initialize(&self, config: &ControlPolicyConfig) -> Vec<(String, Result<FanState>)> {
        let mut results = Vec::new();
        for fan in &config.fans {
            let result = match self.lock(&fan.fan_id).await {
                Ok(mut handle) => {
                    let percent = match handle.slot.state.control_mode {
                        ControlMode::Auto => fan.max_speed_percent,
                        ControlMode::Manual => handle.slot.state.speed_percent,
                    };
                    handle.drive(percent).await
                }
                Err(e) => Err(e),
            };
            match &result {
                Ok(state) => info!(fan = %fan.fan_id, percent = state.speed_percent, "Initial fan speed applied"),
                Err(e) => warn!(fan = %fan.fan_id, error = %e, "Failed to apply initial fan speed"),
            }
            results.push((fan.fan_id.clone(), result));
        }
        results
    }

    /// Take exclusive control of one fan
    pub async fn lock(&self, fan_id: &str) -> Result<FanHandle<'_>> {
        let slot = self
            .slots
            .read()
            .get(fan_id)
            .cloned()
            .ok_or_else(|| ThermalError::FanNotFound(fan_id.to_string()))?;

        Ok(FanHandle {
            actuator: self,
            slot: slot.lock_owned().await,
        })
    }

    /// Apply a computed command
    pub async fn apply(&self, fan_id: &str, command: FanCommand) -> Result<FanState> {
        self.lock(fan_id).await?.apply(command).await
    }

    /// Switch to Manual and drive the fan at `percent`
    ///
    /// Out-of-range speeds fail before anything is touched.
    pub async fn set_manual(&self, fan_id: &str, percent: i64) -> Result<FanState> {
        let percent = validate_speed_percent(percent)?;
        let mut handle = self.lock(fan_id).await?;

        let state = handle.drive(percent).await?;
        if state.control_mode != ControlMode::Manual {
            handle.slot.state.control_mode = ControlMode::Manual;
            handle.slot.state.last_updated = Utc::now();
            handle.publish();
        }
        info!(fan = %fan_id, percent, "Manual fan speed set");
        Ok(handle.state())
    }

    /// Switch control mode; Auto requires a target temperature
    pub async fn set_mode(&self, fan_id: &str, mode: ControlMode, target_temp: Option<f64>) -> Result<FanState> {
        let target = match (mode, target_temp) {
            (ControlMode::Auto, None) => {
                return Err(ThermalError::MissingConfig(format!(
                    "target_temp is required to switch {} to auto mode",
                    fan_id
                )))
            }
            (_, Some(t)) => Some(validate_temperature("target_temp", t)?),
            (ControlMode::Manual, None) => None,
        };

        let mut handle = self.lock(fan_id).await?;
        let state = &mut handle.slot.state;
        state.control_mode = mode;
        if target.is_some() {
            state.target_temp = target;
        }
        state.last_updated = Utc::now();
        handle.publish();

        info!(fan = %fan_id, mode = mode.as_str(), target = ?target, "Fan control mode changed");
        Ok(handle.state())
    }

    /// Last published state of every fan (or one), sorted by id
    pub fn states(&self, fan_id: Option<&str>) -> Vec<FanState> {
        let published = self.published.read();
        let mut states: Vec<FanState> = match fan_id {
            Some(id) => published.get(id).cloned().into_iter().collect(),
            None => published.values().cloned().collect(),
        };
        states.sort_by(|a, b| a.fan_id.cmp(&b.fan_id));
        states
    }

    pub fn len(&self) -> usize {
        self.published.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn call_driver<T, F>(&self, fan_id: &str, op: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn FanDriver) -> Result<T> + Send + 'static,
    {
        let driver = self.driver.clone();
        let task = tokio::task::spawn_blocking(move || f(driver.as_ref()));

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ThermalError::actuator(fan_id, format!("{} task panicked: {}", op, e))),
            Err(_) => Err(ThermalError::Timeout(format!(
                "{} on fan {} exceeded {}ms",
                op,
                fan_id,
                self.timeout.as_millis()
            ))),
        }
    }
}

/// Exclusive access to one fan for one control operation
pub struct FanHandle<'a> {
    actuator: &'a FanActuator,
    slot: OwnedMutexGuard<FanSlot>,
}

impl FanHandle<'_> {
    pub fn state(&self) -> FanState {
        self.slot.state.clone()
    }

    pub fn fan_id(&self) -> &str {
        &self.slot.state.fan_id
    }

    /// Apply an evaluator command; Manual fans reject `SetSpeed`
    pub async fn apply(&mut self, command: FanCommand) -> Result<FanState> {
        match command {
            FanCommand::NoChange => Ok(self.state()),
            FanCommand::SetSpeed(percent) => {
                if self.slot.state.control_mode == ControlMode::Manual {
                    return Err(ThermalError::ManualOverride {
                        fan_id: self.fan_id().to_string(),
                    });
                }
                let percent = validate_speed_percent(percent as i64)?;
                self.drive(percent).await
            }
        }
    }

    /// Read back RPM and update health
    pub async fn observe(&mut self) -> FanState {
        let fan_id = self.fan_id().to_string();
        let id = fan_id.clone();
        let read = self
            .actuator
            .call_driver(&fan_id, "read_rpm", move |d| d.read_rpm(&id))
            .await;

        let health = *self.actuator.health.read();
        let previous = self.slot.state.status;

        match read {
            Ok(rpm) => {
                self.slot.state.speed_rpm = rpm;
                if let (Some(rpm), Some(max_rpm)) = (rpm, self.slot.max_rpm) {
                    let expected = max_rpm as f64 * self.slot.state.speed_percent as f64 / 100.0;
                    let tolerance = max_rpm as f64 * health.rpm_tolerance_percent / 100.0;
                    if (rpm as f64 - expected).abs() > tolerance {
                        self.slot.mismatches = self.slot.mismatches.saturating_add(1);
                        let mismatch = ThermalError::SpeedMismatch {
                            fan_id: fan_id.clone(),
                            expected_rpm: expected.round() as u32,
                            observed_rpm: rpm,
                        };
                        debug!(fan = %fan_id, count = self.slot.mismatches, "{}", mismatch);
                    } else {
                        self.slot.mismatches = 0;
                    }
                }
            }
            Err(e) => debug!(fan = %fan_id, error = %e, "RPM read failed"),
        }

        let status = self.slot.derive_status(health.mismatch_cycles);
        if status != previous {
            self.slot.state.status = status;
            self.slot.state.last_updated = Utc::now();
            warn!(fan = %fan_id, from = previous.as_str(), to = status.as_str(), "Fan health changed");
        }
        self.publish();
        self.state()
    }

    /// Write a speed regardless of mode
    async fn drive(&mut self, percent: u8) -> Result<FanState> {
        let fan_id = self.fan_id().to_string();
        let id = fan_id.clone();
        let result = self
            .actuator
            .call_driver(&fan_id, "write_speed", move |d| d.write_speed(&id, percent))
            .await;

        let now = Utc::now();
        match result {
            Ok(()) => {
                self.slot.write_failed = false;
                if self.slot.state.speed_percent != percent {
                    debug!(fan = %fan_id, from = self.slot.state.speed_percent, to = percent, "Fan speed changed");
                    self.slot.state.speed_percent = percent;
                    self.slot.state.last_updated = now;
                }
                let health = *self.actuator.health.read();
                self.slot.state.status = self.slot.derive_status(health.mismatch_cycles);
                self.publish();
                Ok(self.state())
            }
            Err(e) => {
                self.slot.write_failed = true;
                if self.slot.state.status != FanStatus::Error {
                    self.slot.state.status = FanStatus::Error;
                    self.slot.state.last_updated = now;
                }
                self.publish();
                Err(e)
            }
        }
    }

    fn publish(&self) {
        let state = &self.slot.state;
        if let Some(entry) = self.actuator.published.write().get_mut(&state.fan_id) {
            *entry = state.clone();
        }
    }
}
