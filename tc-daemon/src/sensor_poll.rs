//! Sensor pollers
//!
//! One task per configured sysfs temperature source. Each tick reads the
//! file on the blocking pool and pushes the value through the controller's
//! ingestor, so polled and externally pushed readings follow the same path.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tc_core::constants::limits::MAX_CONSECUTIVE_ERRORS;
use tc_core::{RawSample, ThermalController};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SensorBinding;
use crate::hardware::read_millidegrees;

#[derive(Default)]
pub struct SensorPollers {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SensorPollers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop any running pollers and start one per binding
    pub fn restart(&self, controller: &Arc<ThermalController>, bindings: &[SensorBinding], interval: Duration) {
        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }

        for binding in bindings {
            let controller = Arc::clone(controller);
            let binding = binding.clone();
            tasks.push(tokio::spawn(poll_sensor(controller, binding, interval)));
        }

        info!(sensors = tasks.len(), interval_ms = interval.as_millis() as u64, "Sensor pollers started");
    }

    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }
}

async fn poll_sensor(controller: Arc<ThermalController>, binding: SensorBinding, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures: u32 = 0;

    loop {
        ticker.tick().await;

        match poll_once(&controller, &binding).await {
            Ok(celsius) => {
                if failures > 0 {
                    info!(sensor = %binding.sensor_id, failures, "Sensor recovered");
                    failures = 0;
                }
                debug!(sensor = %binding.sensor_id, celsius, "Sensor polled");
            }
            Err(e) => {
                failures += 1;
                if failures == 1 || failures % MAX_CONSECUTIVE_ERRORS == 0 {
                    warn!(
                        sensor = %binding.sensor_id,
                        path = %binding.source_path.display(),
                        failures,
                        error = %e,
                        "Sensor poll failed"
                    );
                }
            }
        }
    }
}

async fn poll_once(controller: &Arc<ThermalController>, binding: &SensorBinding) -> Result<f64, String> {
    let path = binding.source_path.clone();
    let celsius = tokio::task::spawn_blocking(move || read_millidegrees(&path))
        .await
        .map_err(|e| format!("Temperature read task panicked: {}", e))??;

    controller
        .ingest(RawSample::celsius(binding.sensor_id.clone(), celsius))
        .await
        .map(|reading| reading.value)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tc_core::{
        ControlPolicyConfig, ControllerOptions, FanDriver, InMemoryHistoryStore, TracingAlertSink,
    };
    use tempfile::TempDir;

    struct NoFans;

    impl FanDriver for NoFans {
        fn write_speed(&self, _fan_id: &str, _percent: u8) -> tc_error::Result<()> {
            Ok(())
        }
        fn read_rpm(&self, _fan_id: &str) -> tc_error::Result<Option<u32>> {
            Ok(None)
        }
    }

    async fn controller() -> Arc<ThermalController> {
        ThermalController::new(
            Arc::new(InMemoryHistoryStore::new()),
            Arc::new(NoFans),
            Arc::new(TracingAlertSink),
            ControlPolicyConfig::default(),
            ControllerOptions::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_poll_once_ingests_celsius() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temp1_input");
        std::fs::write(&path, "61250\n").unwrap();

        let ctrl = controller().await;
        let binding = SensorBinding {
            sensor_id: "CPU_TEMP_1".into(),
            source_path: path,
        };
        assert_eq!(poll_once(&ctrl, &binding).await.unwrap(), 61.25);

        let latest = ctrl.get_latest_readings(Some("CPU_TEMP_1")).await.unwrap();
        assert_eq!(latest[0].value, 61.25);
    }

    #[tokio::test]
    async fn test_poll_once_rejects_implausible_value() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temp1_input");
        std::fs::write(&path, "-273000\n").unwrap();

        let ctrl = controller().await;
        let binding = SensorBinding {
            sensor_id: "CPU_TEMP_1".into(),
            source_path: path,
        };
        assert!(poll_once(&ctrl, &binding).await.is_err());
        assert!(ctrl.get_history("CPU_TEMP_1", chrono::DateTime::UNIX_EPOCH, chrono::Utc::now())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_restart_replaces_tasks() {
        let ctrl = controller().await;
        let pollers = SensorPollers::new();
        let binding = |id: &str| SensorBinding {
            sensor_id: id.into(),
            source_path: "/nonexistent/temp1_input".into(),
        };

        pollers.restart(&ctrl, &[binding("A"), binding("B")], Duration::from_millis(50));
        assert_eq!(pollers.len(), 2);
        pollers.restart(&ctrl, &[binding("A")], Duration::from_millis(50));
        assert_eq!(pollers.len(), 1);
        pollers.stop();
        assert_eq!(pollers.len(), 0);
    }
}
