//! JSON persistence for fan and alert state
//!
//! A snapshot is written at the end of each control cycle so that manual
//! overrides and open alerts survive a daemon restart. Files are written to a
//! sibling temp file first and renamed into place.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::alerts::Alert;
use crate::data::types::FanState;
use crate::data::validation::validate_file_size;
use tc_error::{Result, ThermalError};

/// Current on-disk format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything the control core needs to resume after a restart
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub fans: Vec<FanState>,
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

impl StateSnapshot {
    pub fn new(fans: Vec<FanState>, alerts: Vec<Alert>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            fans,
            alerts,
        }
    }
}

/// Load a snapshot; a missing file is not an error
pub fn load_snapshot(path: &Path) -> Result<Option<StateSnapshot>> {
    if !path.exists() {
        debug!("No state snapshot at {:?}", path);
        return Ok(None);
    }

    validate_file_size(path)?;

    let content = fs::read_to_string(path).map_err(|e| ThermalError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let snapshot: StateSnapshot = serde_json::from_str(&content)?;

    if snapshot.version > SNAPSHOT_VERSION {
        warn!(
            "State snapshot {:?} has version {} (newer than {}), ignoring",
            path, snapshot.version, SNAPSHOT_VERSION
        );
        return Ok(None);
    }

    Ok(Some(snapshot))
}

/// Atomically replace the snapshot at `path`
pub fn save_snapshot(path: &Path, snapshot: &StateSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| ThermalError::FileWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }

    let json = serde_json::to_string_pretty(snapshot)?;
    let tmp_path = path.with_extension("json.tmp");

    fs::write(&tmp_path, json).map_err(|e| ThermalError::FileWrite {
        path: tmp_path.clone(),
        source: e,
    })?;

    fs::rename(&tmp_path, path).map_err(|e| ThermalError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;

    debug!("Saved state snapshot ({} fans, {} alerts) to {:?}", snapshot.fans.len(), snapshot.alerts.len(), path);
    Ok(())
}
