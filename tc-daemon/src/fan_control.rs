//! Control loop and daemon-wide state
//!
//! Runs [`ThermalController::run_cycle`] on a fixed period, wakes early on
//! config reload, and stops when shutdown is requested. History retention
//! runs as its own task so pruning never delays a cycle.
//!
//! Per-fan failures are already contained by the controller (failed fans get
//! their fail-safe speed and an alert). This loop only tracks how many cycles
//! in a row reported trouble, for log spam control.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tc_core::constants::limits::MAX_CONSECUTIVE_ERRORS;
use tc_core::ThermalController;
use tc_error::Result;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::hardware::SysfsFanDriver;
use crate::sensor_poll::SensorPollers;

/// Shared state for the control loop, retention task and socket server
pub struct DaemonState {
    pub controller: Arc<ThermalController>,
    pub driver: Arc<SysfsFanDriver>,
    config_path: PathBuf,
    config: RwLock<DaemonConfig>,
    pollers: SensorPollers,
    /// Wakes the control loop immediately after a reload
    reload_notify: Notify,
    shutdown: watch::Sender<bool>,
}

impl DaemonState {
    pub fn new(
        controller: Arc<ThermalController>,
        driver: Arc<SysfsFanDriver>,
        config_path: PathBuf,
        config: DaemonConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            controller,
            driver,
            config_path,
            config: RwLock::new(config),
            pollers: SensorPollers::new(),
            reload_notify: Notify::new(),
            shutdown,
        }
    }

    pub fn config(&self) -> DaemonConfig {
        self.config.read().clone()
    }

    /// Start one poller per configured sysfs sensor
    pub fn start_pollers(&self) {
        let config = self.config.read();
        self.pollers
            .restart(&self.controller, &config.hardware.sensors, config.sensor_poll_interval());
    }

    /// Re-read the config file and apply it
    ///
    /// Nothing changes unless the whole file validates. Socket path and
    /// timeouts are fixed at startup; a change to them is logged and ignored.
    pub async fn reload(&self) -> Result<String> {
        let path = self.config_path.clone();
        let new_config = tokio::task::spawn_blocking(move || DaemonConfig::load(&path))
            .await
            .map_err(|e| tc_error::ThermalError::generic(format!("config load task panicked: {}", e)))??;

        let old = self.config();
        if new_config.socket_path != old.socket_path
            || new_config.state_path != old.state_path
            || new_config.operation_timeout_ms != old.operation_timeout_ms
        {
            warn!("socket_path, state_path and operation_timeout_ms only take effect after a restart");
        }

        self.controller.reconfigure(new_config.policy.clone()).await?;
        self.driver.rebind(&new_config.hardware.fans);

        let summary = format!(
            "configuration reloaded: {} fans, {} sensors, {} pollers",
            new_config.policy.fans.len(),
            new_config.policy.all_sensor_ids().len(),
            new_config.hardware.sensors.len()
        );
        *self.config.write() = new_config;
        self.start_pollers();
        self.reload_notify.notify_one();

        info!(path = %self.config_path.display(), "{}", summary);
        Ok(summary)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn stop_pollers(&self) {
        self.pollers.stop();
    }
}

/// Resolve once shutdown has been requested
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    // An Err means the sender is gone, which also means shutdown
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Run control cycles until shutdown
pub async fn run_control_loop(state: Arc<DaemonState>) {
    info!("Control loop starting");

    let mut shutdown = state.shutdown_signal();
    let mut troubled_cycles: u32 = 0;

    loop {
        if state.is_shutting_down() {
            break;
        }

        let period = state.config().cycle_interval();
        let next = tokio::time::Instant::now() + period;
        let report = state.controller.run_cycle().await;

        if report.failures > 0 || report.store_degraded {
            troubled_cycles += 1;
            if troubled_cycles == 1 || troubled_cycles % MAX_CONSECUTIVE_ERRORS == 0 {
                let failed: Vec<&str> = report
                    .fans
                    .iter()
                    .filter(|f| f.error.is_some())
                    .map(|f| f.fan_id.as_str())
                    .collect();
                error!(
                    cycle = report.cycle,
                    consecutive = troubled_cycles,
                    failed = ?failed,
                    store_degraded = report.store_degraded,
                    "Control cycle completed with failures"
                );
            }
        } else if troubled_cycles > 0 {
            info!(after = troubled_cycles, "Control loop recovered");
            troubled_cycles = 0;
        }

        tokio::select! {
            _ = tokio::time::sleep_until(next) => {}
            _ = state.reload_notify.notified() => {
                debug!("Control loop woken up by reload");
            }
            _ = wait_for_shutdown(&mut shutdown) => {}
        }
    }

    info!("Control loop stopped");
}

/// Periodically drop history older than the retention window
pub async fn run_retention(state: Arc<DaemonState>) {
    let mut shutdown = state.shutdown_signal();
    let mut failures: u32 = 0;

    loop {
        let config = state.config();
        tokio::select! {
            _ = tokio::time::sleep(config.prune_interval()) => {}
            _ = wait_for_shutdown(&mut shutdown) => break,
        }

        let Ok(retention) = chrono::Duration::from_std(config.retention()) else {
            warn!(secs = config.retention_secs, "Retention window out of range, skipping prune");
            continue;
        };
        let cutoff = Utc::now() - retention;

        match state.controller.prune_history(cutoff).await {
            Ok(removed) => {
                failures = 0;
                if removed > 0 {
                    debug!(removed, cutoff = %cutoff, "Pruned history");
                }
            }
            Err(e) => {
                failures += 1;
                if failures == 1 || failures % MAX_CONSECUTIVE_ERRORS == 0 {
                    warn!(failures, error = %e, "History prune failed");
                }
            }
        }
    }

    debug!("Retention task stopped");
}
