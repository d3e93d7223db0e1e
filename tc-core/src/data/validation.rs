//! Input validation for thermctl
//!
//! Everything that crosses into the control core from a sensor, an operator
//! or a config file passes through one of these checks first.

use std::path::Path;

use crate::constants::{limits, speed, temperature};
use tc_error::{Result, ThermalError};

/// Validates a fan or sensor identifier, returning it trimmed
pub fn validate_identifier(id: &str) -> Result<String> {
    let trimmed = id.trim();

    if trimmed.is_empty() {
        return Err(ThermalError::invalid_id(id, "identifier cannot be empty"));
    }

    if trimmed.len() > limits::MAX_IDENTIFIER_LEN {
        return Err(ThermalError::invalid_id(
            id,
            format!("exceeds maximum length of {} characters", limits::MAX_IDENTIFIER_LEN),
        ));
    }

    if let Some(c) = trimmed
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')))
    {
        return Err(ThermalError::invalid_id(id, format!("invalid character {:?}", c)));
    }

    Ok(trimmed.to_string())
}

/// Validates an identifier taken verbatim from a config file
///
/// Config ids are matched exactly against ingested and operator ids, which are
/// trimmed, so surrounding whitespace is rejected rather than stripped.
pub fn validate_config_identifier(field: &str, id: &str) -> Result<()> {
    let trimmed = validate_identifier(id)
        .map_err(|e| ThermalError::invalid_config(field, e.to_string()))?;
    if trimmed != id {
        return Err(ThermalError::invalid_config(
            field,
            format!("identifier {:?} has surrounding whitespace", id),
        ));
    }
    Ok(())
}

/// Validates a commanded speed (0-100)
pub fn validate_speed_percent(value: i64) -> Result<u8> {
    if !(speed::MIN_PERCENT as i64..=speed::MAX_PERCENT as i64).contains(&value) {
        return Err(ThermalError::out_of_range(
            "speed_percent",
            value as f64,
            speed::MIN_PERCENT as f64,
            speed::MAX_PERCENT as f64,
        ));
    }
    Ok(value as u8)
}

/// Validates a temperature in °C is finite and physically plausible
pub fn validate_temperature(field: &str, celsius: f64) -> Result<f64> {
    if !celsius.is_finite()
        || !(temperature::PHYSICAL_MIN_CELSIUS..=temperature::PHYSICAL_MAX_CELSIUS).contains(&celsius)
    {
        return Err(ThermalError::out_of_range(
            field,
            celsius,
            temperature::PHYSICAL_MIN_CELSIUS,
            temperature::PHYSICAL_MAX_CELSIUS,
        ));
    }
    Ok(celsius)
}

/// Validates a config or state file is small enough to load
pub fn validate_file_size(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| ThermalError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    if metadata.len() > limits::MAX_FILE_SIZE {
        return Err(ThermalError::FileTooLarge {
            path: path.to_path_buf(),
            size: metadata.len(),
            max_size: limits::MAX_FILE_SIZE,
        });
    }

    Ok(())
}
