//! sysfs fan driver
//!
//! Drives hwmon PWM outputs for the fans named in the config's hardware
//! bindings. Every call is blocking file I/O; the actuator runs it on the
//! blocking pool under its own deadline.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::RwLock;
use tc_core::constants::temperature::MILLIDEGREE_DIVISOR;
use tc_core::FanDriver;
use tc_error::{Result, ThermalError};
use tracing::debug;

use crate::config::FanBinding;

/// `pwmN_enable` value for manual (software) control
const PWM_ENABLE_MANUAL: u8 = 1;

pub struct SysfsFanDriver {
    bindings: RwLock<HashMap<String, FanBinding>>,
}

impl SysfsFanDriver {
    pub fn new(bindings: &[FanBinding]) -> Self {
        let driver = Self {
            bindings: RwLock::new(HashMap::new()),
        };
        driver.rebind(bindings);
        driver
    }

    /// Replace the fan-to-file mapping (config reload)
    pub fn rebind(&self, bindings: &[FanBinding]) {
        let map = bindings
            .iter()
            .map(|b| (b.fan_id.clone(), b.clone()))
            .collect();
        *self.bindings.write() = map;
    }

    fn binding(&self, fan_id: &str) -> Result<FanBinding> {
        self.bindings
            .read()
            .get(fan_id)
            .cloned()
            .ok_or_else(|| ThermalError::actuator(fan_id, "no hardware binding configured"))
    }
}

impl FanDriver for SysfsFanDriver {
    fn write_speed(&self, fan_id: &str, percent: u8) -> Result<()> {
        let binding = self.binding(fan_id)?;
        let value = percent_to_pwm(percent, binding.pwm_max);
        set_pwm(&binding.pwm_path, value).map_err(|e| ThermalError::actuator(fan_id, e))?;
        debug!(fan = %fan_id, percent, pwm = value, "PWM written");
        Ok(())
    }

    fn read_rpm(&self, fan_id: &str) -> Result<Option<u32>> {
        let binding = self.binding(fan_id)?;
        let Some(path) = binding.rpm_path else {
            return Ok(None);
        };

        let content = std::fs::read_to_string(&path)
            .map_err(|e| ThermalError::actuator(fan_id, format!("failed to read {}: {}", path.display(), e)))?;
        let rpm = content
            .trim()
            .parse::<u32>()
            .map_err(|e| ThermalError::actuator(fan_id, format!("failed to parse RPM: {}", e)))?;
        Ok(Some(rpm))
    }
}

fn percent_to_pwm(percent: u8, pwm_max: u8) -> u8 {
    let ratio = f64::from(percent.min(100)) / 100.0;
    (ratio * f64::from(pwm_max)).round().clamp(0.0, f64::from(pwm_max)) as u8
}

/// Write a raw value to a `pwmN` file, switching `pwmN_enable` to manual first
fn set_pwm(pwm_path: &Path, value: u8) -> std::result::Result<(), String> {
    let file_name = pwm_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| "Invalid PWM path".to_string())?;

    let suffix = file_name.strip_prefix("pwm").unwrap_or_default();
    if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("{} is not a pwmN control file", pwm_path.display()));
    }

    let enable_path = pwm_path.with_file_name(format!("{}_enable", file_name));
    if enable_path.exists() {
        let current = std::fs::read_to_string(&enable_path)
            .ok()
            .and_then(|s| s.trim().parse::<u8>().ok());
        if current != Some(PWM_ENABLE_MANUAL) {
            std::fs::write(&enable_path, PWM_ENABLE_MANUAL.to_string())
                .map_err(|e| format!("Failed to enable manual PWM control: {}", e))?;
        }
    }

    std::fs::write(pwm_path, value.to_string()).map_err(|e| format!("Failed to write PWM: {}", e))
}

/// Read a millidegree sysfs temperature file as °C
pub fn read_millidegrees(path: &Path) -> std::result::Result<f64, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

    let millidegrees: f64 = content
        .trim()
        .parse()
        .map_err(|e| format!("Failed to parse temperature: {}", e))?;

    Ok(millidegrees / MILLIDEGREE_DIVISOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn hwmon(dir: &TempDir) -> FanBinding {
        std::fs::write(dir.path().join("pwm1"), "0\n").unwrap();
        std::fs::write(dir.path().join("pwm1_enable"), "2\n").unwrap();
        std::fs::write(dir.path().join("fan1_input"), "1180\n").unwrap();
        FanBinding {
            fan_id: "CPU_FAN_1".into(),
            pwm_path: dir.path().join("pwm1"),
            rpm_path: Some(dir.path().join("fan1_input")),
            pwm_max: 255,
        }
    }

    fn read(path: PathBuf) -> String {
        std::fs::read_to_string(path).unwrap().trim().to_string()
    }

    #[test]
    fn test_write_scales_and_enables_manual() {
        let dir = TempDir::new().unwrap();
        let driver = SysfsFanDriver::new(&[hwmon(&dir)]);

        driver.write_speed("CPU_FAN_1", 50).unwrap();
        assert_eq!(read(dir.path().join("pwm1")), "128");
        assert_eq!(read(dir.path().join("pwm1_enable")), "1");

        driver.write_speed("CPU_FAN_1", 100).unwrap();
        assert_eq!(read(dir.path().join("pwm1")), "255");
    }

    #[test]
    fn test_read_rpm() {
        let dir = TempDir::new().unwrap();
        let mut binding = hwmon(&dir);
        let driver = SysfsFanDriver::new(&[binding.clone()]);
        assert_eq!(driver.read_rpm("CPU_FAN_1").unwrap(), Some(1180));

        binding.rpm_path = None;
        driver.rebind(&[binding]);
        assert_eq!(driver.read_rpm("CPU_FAN_1").unwrap(), None);
    }

    #[test]
    fn test_unbound_fan_is_actuator_error() {
        let driver = SysfsFanDriver::new(&[]);
        let err = driver.write_speed("GPU_FAN_1", 40).unwrap_err();
        assert!(matches!(err, ThermalError::Actuator { .. }));
    }

    #[test]
    fn test_rejects_non_pwm_file() {
        let dir = TempDir::new().unwrap();
        let mut binding = hwmon(&dir);
        binding.pwm_path = dir.path().join("fan1_input");
        let driver = SysfsFanDriver::new(&[binding]);
        assert!(driver.write_speed("CPU_FAN_1", 40).is_err());
        assert_eq!(read(dir.path().join("fan1_input")), "1180");
    }

    #[test]
    fn test_percent_to_pwm() {
        assert_eq!(percent_to_pwm(0, 255), 0);
        assert_eq!(percent_to_pwm(20, 255), 51);
        assert_eq!(percent_to_pwm(100, 100), 100);
        assert_eq!(percent_to_pwm(150, 255), 255);
    }

    #[test]
    fn test_read_millidegrees() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temp1_input");
        std::fs::write(&path, "45500\n").unwrap();
        assert_eq!(read_millidegrees(&path).unwrap(), 45.5);

        std::fs::write(&path, "garbage").unwrap();
        assert!(read_millidegrees(&path).is_err());
    }
}
