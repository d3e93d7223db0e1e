//! Thermal control loop orchestration
//!
//! [`ThermalController`] ties the ingestor, history store, evaluator,
//! actuator and alert manager together and exposes the query/command
//! interface used by the daemon socket.
//!
//! One control cycle:
//!
//! 1. Every configured fan is handled in its own task: lock the fan, read the
//!    latest reading of each bound sensor, evaluate, apply, read back RPM.
//!    A failure on one fan never aborts the others.
//! 2. Alert conditions are re-evaluated for every sensor and fan.
//! 3. Fan and alert state is persisted when a snapshot path is configured.
//!
//! A failed history read is missing input for that fan, which runs it at
//! full speed. If every read of a cycle failed the store is considered down
//! and a critical alert is raised on the control loop itself.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actuator::{FanActuator, FanDriver};
use crate::alerts::{Alert, AlertManager, AlertSeverity, AlertSink, AlertStatus};
use crate::constants::{limits, timing};
use crate::data::{
    save_snapshot, validate_identifier, ControlMode, ControlPolicyConfig, FanCommand, FanPolicy,
    FanState, RawSample, SensorReading, StateSnapshot,
};
use crate::engine::{combine_inputs, evaluate};
use crate::history::HistoryStore;
use crate::ingest::Ingestor;
use tc_error::{Result, ThermalError};

/// Runtime knobs that are not part of the control policy
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Deadline for each history or hardware operation
    pub operation_timeout: Duration,
    /// Deadline for a whole cycle
    pub cycle_deadline: Duration,
    /// Where to persist fan and alert state after each cycle
    pub snapshot_path: Option<PathBuf>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            operation_timeout: timing::DEFAULT_OPERATION_TIMEOUT,
            cycle_deadline: timing::DEFAULT_CYCLE_INTERVAL,
            snapshot_path: None,
        }
    }
}

/// What one fan's control input looked like this cycle
#[derive(Debug, Clone, PartialEq)]
pub enum SensorInput {
    Fresh(SensorReading),
    Stale(SensorReading),
    Missing,
    Failed(String),
}

impl SensorInput {
    fn celsius(&self) -> Option<f64> {
        match self {
            SensorInput::Fresh(r) => Some(r.value),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            SensorInput::Fresh(_) => "ok".to_string(),
            SensorInput::Stale(r) => format!("last reading at {} is stale", r.timestamp),
            SensorInput::Missing => "no reading recorded".to_string(),
            SensorInput::Failed(e) => e.clone(),
        }
    }
}

/// Outcome of one fan's handling within a cycle
#[derive(Debug, Clone, PartialEq)]
pub struct FanReport {
    pub fan_id: String,
    /// Hottest fresh bound reading; `None` means the fail-safe branch ran
    pub input_temp: Option<f64>,
    pub command: Option<FanCommand>,
    /// State after the cycle, when the fan could be locked
    pub state: Option<FanState>,
    pub error: Option<String>,
}

/// Summary of one control cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub fans: Vec<FanReport>,
    /// Fans whose handling failed
    pub failures: u32,
    /// Every history read of the cycle failed
    pub store_degraded: bool,
}

/// Control loop health, for status queries
#[derive(Debug, Clone)]
pub struct ControllerStatus {
    pub cycles: u64,
    pub last_cycle: Option<CycleReport>,
    pub fans: usize,
    pub sensors: usize,
    pub open_alerts: usize,
}

/// The thermal control core
pub struct ThermalController {
    store: Arc<dyn HistoryStore>,
    ingestor: Ingestor,
    actuator: FanActuator,
    alerts: AlertManager,
    policy: RwLock<Arc<ControlPolicyConfig>>,
    options: ControllerOptions,
    cycles: AtomicU64,
    last_report: RwLock<Option<CycleReport>>,
    snapshot_failures: AtomicU32,
}

impl ThermalController {
    /// Build a controller around a validated policy
    pub async fn new(
        store: Arc<dyn HistoryStore>,
        driver: Arc<dyn FanDriver>,
        sink: Arc<dyn AlertSink>,
        policy: ControlPolicyConfig,
        options: ControllerOptions,
    ) -> Result<Arc<Self>> {
        policy.validate()?;
        let policy = Arc::new(policy);

        let actuator = FanActuator::with_timeout(driver, options.operation_timeout);
        actuator.reconcile(&policy).await;

        Ok(Arc::new(Self {
            ingestor: Ingestor::new(store.clone(), policy.clone()),
            store,
            actuator,
            alerts: AlertManager::new(sink),
            policy: RwLock::new(policy),
            options,
            cycles: AtomicU64::new(0),
            last_report: RwLock::new(None),
            snapshot_failures: AtomicU32::new(0),
        }))
    }

    /// Current policy snapshot
    pub fn policy(&self) -> Arc<ControlPolicyConfig> {
        self.policy.read().clone()
    }

    /// Swap in a new policy; takes effect on the next cycle
    pub async fn reconfigure(&self, policy: ControlPolicyConfig) -> Result<()> {
        policy.validate()?;
        let policy = Arc::new(policy);

        self.actuator.reconcile(&policy).await;
        self.ingestor.set_policy(policy.clone());
        *self.policy.write() = policy.clone();

        info!(fans = policy.fans.len(), sensors = policy.sensors.len(), "Control policy applied");
        Ok(())
    }

    /// Re-apply persisted fan modes/speeds and alerts
    pub async fn restore(&self, snapshot: StateSnapshot) {
        let fans = snapshot.fans.len();
        let alerts = snapshot.alerts.len();
        self.actuator.restore(snapshot.fans).await;
        self.alerts.restore(snapshot.alerts);
        info!(fans, alerts, "Restored persisted state");
    }

    /// Boot fail-safe before the first cycle
    pub async fn initialize(&self) -> Vec<(String, Result<FanState>)> {
        let policy = self.policy();
        self.actuator.initialize(&policy).await
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::new(self.actuator.states(None), self.alerts.list(None, None))
    }

    // ------------------------------------------------------------------------
    // Control cycle
    // ------------------------------------------------------------------------

    /// Run one full control cycle
    pub async fn run_cycle(self: &Arc<Self>) -> CycleReport {
        let started = Instant::now();
        let started_at = Utc::now();
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let policy = self.policy();

        let mut tasks = JoinSet::new();
        for fan in &policy.fans {
            let ctrl = Arc::clone(self);
            let fan = fan.clone();
            let policy = policy.clone();
            tasks.spawn(async move { ctrl.control_fan(&fan, &policy).await });
        }

        let deadline = tokio::time::Instant::now() + self.options.cycle_deadline;
        let mut fans = Vec::with_capacity(policy.fans.len());
        let mut inputs: HashMap<String, SensorInput> = HashMap::new();
        let mut timed_out = false;

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((report, sensor_inputs)))) => {
                    fans.push(report);
                    for (sensor_id, input) in sensor_inputs {
                        inputs.entry(sensor_id).or_insert(input);
                    }
                }
                Ok(Some(Err(e))) => warn!(error = %e, "Fan control task failed"),
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    tasks.abort_all();
                    break;
                }
            }
        }

        // Fans with no report panicked or ran past the deadline
        for fan in &policy.fans {
            if !fans.iter().any(|r| r.fan_id == fan.fan_id) {
                let reason = if timed_out { "cycle deadline exceeded" } else { "control task failed" };
                warn!(fan = %fan.fan_id, "{}", reason);
                fans.push(FanReport {
                    fan_id: fan.fan_id.clone(),
                    input_temp: None,
                    command: None,
                    state: self.actuator.states(Some(&fan.fan_id)).into_iter().next(),
                    error: Some(reason.to_string()),
                });
            }
        }
        fans.sort_by(|a, b| a.fan_id.cmp(&b.fan_id));

        let store_degraded = self.evaluate_alerts(&policy, &mut inputs, &fans).await;
        self.persist().await;

        let report = CycleReport {
            cycle,
            started_at,
            duration: started.elapsed(),
            failures: fans.iter().filter(|f| f.error.is_some()).count() as u32,
            fans,
            store_degraded,
        };

        debug!(
            cycle,
            duration_ms = report.duration.as_millis() as u64,
            failures = report.failures,
            "Control cycle complete"
        );
        *self.last_report.write() = Some(report.clone());
        report
    }

    /// read-latest -> evaluate -> apply -> observe for one fan, under its lock
    async fn control_fan(
        &self,
        fan: &FanPolicy,
        policy: &ControlPolicyConfig,
    ) -> (FanReport, Vec<(String, SensorInput)>) {
        let mut report = FanReport {
            fan_id: fan.fan_id.clone(),
            input_temp: None,
            command: None,
            state: None,
            error: None,
        };

        let mut handle = match self.actuator.lock(&fan.fan_id).await {
            Ok(h) => h,
            Err(e) => {
                report.error = Some(e.to_string());
                return (report, Vec::new());
            }
        };

        let mut sensor_inputs = Vec::with_capacity(fan.sensor_ids.len());
        for sensor_id in &fan.sensor_ids {
            let input = self.read_input(sensor_id, policy.max_reading_age()).await;
            sensor_inputs.push((sensor_id.clone(), input));
        }

        let input_temp = combine_inputs(sensor_inputs.iter().map(|(_, i)| i.celsius()));
        let command = evaluate(&handle.state(), input_temp, fan);
        report.input_temp = input_temp;
        report.command = Some(command);

        if input_temp.is_none() && handle.state().control_mode == ControlMode::Auto {
            debug!(fan = %fan.fan_id, "No usable input, running fail-safe speed");
        }

        if let Err(e) = handle.apply(command).await {
            warn!(fan = %fan.fan_id, error = %e, "Failed to apply fan command");
            report.error = Some(e.to_string());
        }

        report.state = Some(handle.observe().await);
        (report, sensor_inputs)
    }

    async fn read_input(&self, sensor_id: &str, max_age: Option<Duration>) -> SensorInput {
        let id = sensor_id.to_string();
        match self.with_store("latest", move |s| s.latest(&id)).await {
            Ok(Some(reading)) => {
                let stale = max_age.is_some_and(|max| {
                    (Utc::now() - reading.timestamp)
                        .to_std()
                        .map(|age| age > max)
                        .unwrap_or(false)
                });
                if stale {
                    SensorInput::Stale(reading)
                } else {
                    SensorInput::Fresh(reading)
                }
            }
            Ok(None) => SensorInput::Missing,
            Err(e) => {
                warn!(sensor = %sensor_id, error = %e, "Failed to read latest reading");
                SensorInput::Failed(e.to_string())
            }
        }
    }

    /// Returns whether the store looked unreachable this cycle
    async fn evaluate_alerts(
        &self,
        policy: &ControlPolicyConfig,
        inputs: &mut HashMap<String, SensorInput>,
        fans: &[FanReport],
    ) -> bool {
        let bound: Vec<&String> = policy.fans.iter().flat_map(|f| f.sensor_ids.iter()).collect();

        // Sensors no fan consumes still get threshold alerts
        for sensor_id in policy.all_sensor_ids() {
            if !inputs.contains_key(&sensor_id) {
                let input = self.read_input(&sensor_id, policy.max_reading_age()).await;
                inputs.insert(sensor_id, input);
            }
        }

        for (sensor_id, input) in inputs.iter() {
            if let SensorInput::Fresh(reading) = input {
                self.alerts.observe_reading(reading, policy.thresholds(sensor_id));
            }
            if bound.contains(&sensor_id) {
                let available = matches!(input, SensorInput::Fresh(_));
                self.alerts.observe_sensor_availability(sensor_id, available, &input.describe());
            }
        }

        for report in fans {
            if let Some(state) = &report.state {
                self.alerts.observe_fan(state);
            }
        }

        let store_degraded =
            !inputs.is_empty() && inputs.values().all(|i| matches!(i, SensorInput::Failed(_)));
        if store_degraded {
            warn!(sensors = inputs.len(), "Every history read failed this cycle");
        }
        self.alerts.observe_store(store_degraded);
        store_degraded
    }

    async fn persist(&self) {
        let Some(path) = self.options.snapshot_path.clone() else {
            return;
        };
        let snapshot = self.snapshot();
        let result = tokio::task::spawn_blocking(move || save_snapshot(&path, &snapshot)).await;

        let error = match result {
            Ok(Ok(())) => {
                self.snapshot_failures.store(0, Ordering::SeqCst);
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("snapshot task panicked: {}", e),
        };

        let failures = self.snapshot_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures == 1 || failures % limits::MAX_CONSECUTIVE_ERRORS == 0 {
            warn!(failures, error = %error, "Failed to persist state snapshot");
        }
    }

    // ------------------------------------------------------------------------
    // Query interface
    // ------------------------------------------------------------------------

    /// Latest reading per sensor (or for one sensor)
    pub async fn get_latest_readings(&self, sensor_id: Option<&str>) -> Result<Vec<SensorReading>> {
        let ids = match sensor_id {
            Some(id) => vec![validate_identifier(id)?],
            None => {
                let mut ids = self.policy().all_sensor_ids();
                for id in self.with_store("sensor_ids", |s| s.sensor_ids()).await? {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                ids
            }
        };

        let mut readings = Vec::with_capacity(ids.len());
        for id in &ids {
            let key = id.clone();
            if let Some(r) = self.with_store("latest", move |s| s.latest(&key)).await? {
                readings.push(r);
            }
        }

        if let Some(id) = sensor_id {
            if readings.is_empty() && self.policy().sensor(id.trim()).is_none() {
                return Err(ThermalError::SensorNotFound(id.to_string()));
            }
        }
        Ok(readings)
    }

    /// Last published state of every fan (or one)
    pub fn get_fan_states(&self, fan_id: Option<&str>) -> Result<Vec<FanState>> {
        let states = self.actuator.states(fan_id);
        match fan_id {
            Some(id) if states.is_empty() => Err(ThermalError::FanNotFound(id.to_string())),
            _ => Ok(states),
        }
    }

    pub fn get_alerts(&self, status: Option<AlertStatus>, severity: Option<AlertSeverity>) -> Vec<Alert> {
        self.alerts.list(status, severity)
    }

    /// Stored readings for `since <= t <= until`, oldest first
    pub async fn get_history(
        &self,
        sensor_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<SensorReading>> {
        let id = validate_identifier(sensor_id)?;
        self.with_store("window", move |s| Ok(s.window(&id, since, until)?.collect()))
            .await
    }

    pub fn status(&self) -> ControllerStatus {
        let policy = self.policy();
        ControllerStatus {
            cycles: self.cycles.load(Ordering::SeqCst),
            last_cycle: self.last_report.read().clone(),
            fans: self.actuator.len(),
            sensors: policy.all_sensor_ids().len(),
            open_alerts: self.alerts.open_count(),
        }
    }

    // ------------------------------------------------------------------------
    // Command interface
    // ------------------------------------------------------------------------

    /// Put a fan under manual control at `percent`
    pub async fn set_fan_speed(&self, fan_id: &str, percent: i64) -> Result<FanState> {
        self.actuator.set_manual(fan_id, percent).await
    }

    pub async fn set_fan_mode(
        &self,
        fan_id: &str,
        mode: ControlMode,
        target_temp: Option<f64>,
    ) -> Result<FanState> {
        self.actuator.set_mode(fan_id, mode, target_temp).await
    }

    pub fn acknowledge_alert(&self, alert_id: &str, who: &str, note: Option<String>) -> Result<Alert> {
        self.alerts.acknowledge(parse_alert_id(alert_id)?, who, note)
    }

    pub fn resolve_alert(&self, alert_id: &str, who: &str, note: Option<String>) -> Result<Alert> {
        self.alerts.resolve(parse_alert_id(alert_id)?, who, note)
    }

    /// Validate and store one sample
    pub async fn ingest(self: &Arc<Self>, sample: RawSample) -> Result<SensorReading> {
        let ctrl = Arc::clone(self);
        let timeout = self.options.operation_timeout;
        let task = tokio::task::spawn_blocking(move || ctrl.ingestor.ingest(sample));

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ThermalError::store(format!("ingest task panicked: {}", e))),
            Err(_) => Err(ThermalError::Timeout(format!("ingest exceeded {}ms", timeout.as_millis()))),
        }
    }

    /// Retention enforcement; called by the daemon, never by the cycle
    pub async fn prune_history(&self, older_than: DateTime<Utc>) -> Result<usize> {
        self.with_store("prune", move |s| s.prune(older_than)).await
    }

    async fn with_store<T, F>(&self, op: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn HistoryStore) -> Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        let task = tokio::task::spawn_blocking(move || f(store.as_ref()));

        match tokio::time::timeout(self.options.operation_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ThermalError::store(format!("{} task panicked: {}", op, e))),
            Err(_) => Err(ThermalError::Timeout(format!(
                "history {} exceeded {}ms",
                op,
                self.options.operation_timeout.as_millis()
            ))),
        }
    }
}

fn parse_alert_id(alert_id: &str) -> Result<Uuid> {
    Uuid::parse_str(alert_id.trim())
        .map_err(|e| ThermalError::invalid_id(alert_id, format!("not a valid alert id: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::TracingAlertSink;
    use crate::history::InMemoryHistoryStore;

    struct NullDriver;

    impl FanDriver for NullDriver {
        fn write_speed(&self, _: &str, _: u8) -> Result<()> {
            Ok(())
        }
        fn read_rpm(&self, _: &str) -> Result<Option<u32>> {
            Ok(None)
        }
    }

    async fn controller() -> Arc<ThermalController> {
        let policy = ControlPolicyConfig {
            fans: vec![FanPolicy::new("CPU_FAN_1", vec!["CPU_TEMP_1".into()], 65.0)],
            ..ControlPolicyConfig::default()
        };
        ThermalController::new(
            Arc::new(InMemoryHistoryStore::new()),
            Arc::new(NullDriver),
            Arc::new(TracingAlertSink),
            policy,
            ControllerOptions::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_rejects_invalid_policy() {
        let mut policy = ControlPolicyConfig::default();
        policy.fans.push(FanPolicy::new("CPU_FAN_1", vec![], 65.0));
        policy.fans[0].proportional_band = 0.0;
        let result = ThermalController::new(
            Arc::new(InMemoryHistoryStore::new()),
            Arc::new(NullDriver),
            Arc::new(TracingAlertSink),
            policy,
            ControllerOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(ThermalError::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_reconfigure_rejects_and_keeps_policy() {
        let ctrl = controller().await;
        let mut bad = (*ctrl.policy()).clone();
        bad.fans[0].min_speed_percent = 90;
        bad.fans[0].max_speed_percent = 50;
        assert!(ctrl.reconfigure(bad).await.is_err());
        assert_eq!(ctrl.policy().fans[0].max_speed_percent, 100);
    }

    #[tokio::test]
    async fn test_reconfigure_adds_fan() {
        let ctrl = controller().await;
        let mut policy = (*ctrl.policy()).clone();
        policy.fans.push(FanPolicy::new("GPU_FAN_1", vec!["GPU_TEMP_1".into()], 70.0));
        ctrl.reconfigure(policy).await.unwrap();
        assert_eq!(ctrl.get_fan_states(None).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_queries() {
        let ctrl = controller().await;
        assert!(matches!(ctrl.get_fan_states(Some("NOPE")), Err(ThermalError::FanNotFound(_))));
        assert!(matches!(
            ctrl.get_latest_readings(Some("NOPE")).await,
            Err(ThermalError::SensorNotFound(_))
        ));

        let t = Utc::now();
        ctrl.ingest(RawSample::celsius("CPU_TEMP_1", 50.0).at(t)).await.unwrap();
        let readings = ctrl.get_latest_readings(None).await.unwrap();
        assert_eq!(readings.len(), 1);

        let history = ctrl
            .get_history("CPU_TEMP_1", t - chrono::Duration::seconds(1), t)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_bad_alert_id() {
        let ctrl = controller().await;
        let err = ctrl.acknowledge_alert("not-a-uuid", "oncall", None).unwrap_err();
        assert!(matches!(err, ThermalError::InvalidIdentifier { .. }));
        let err = ctrl.resolve_alert(&Uuid::new_v4().to_string(), "oncall", None).unwrap_err();
        assert!(matches!(err, ThermalError::AlertNotFound(_)));
    }

    #[tokio::test]
    async fn test_status_counts_cycles() {
        let ctrl = controller().await;
        ctrl.run_cycle().await;
        ctrl.run_cycle().await;
        let status = ctrl.status();
        assert_eq!(status.cycles, 2);
        assert_eq!(status.last_cycle.unwrap().cycle, 2);
        assert_eq!(status.fans, 1);
        assert_eq!(status.sensors, 1);
    }
}
