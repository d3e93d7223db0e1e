//! Temperature history store
//!
//! [`HistoryStore`] is the persistence boundary of the control core: an
//! append-only, per-sensor time series. Implementations may block (a database
//! behind it), so async callers go through `spawn_blocking`.
//!
//! [`InMemoryHistoryStore`] keeps one independently locked timeline per
//! sensor, so appends for different sensors never wait on each other.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::constants::limits;
use crate::data::SensorReading;
use tc_error::Result;

/// Lazily consumed, finite, timestamp-ascending sequence of readings
pub type ReadingIter = Box<dyn Iterator<Item = SensorReading> + Send>;

/// Append-only per-sensor time series
pub trait HistoryStore: Send + Sync {
    /// Store a reading. Re-appending an existing (sensor_id, timestamp) is a no-op.
    fn append(&self, reading: SensorReading) -> Result<()>;

    /// Newest reading for the sensor, if any
    fn latest(&self, sensor_id: &str) -> Result<Option<SensorReading>>;

    /// Readings with `since <= timestamp <= until`, oldest first
    fn window(&self, sensor_id: &str, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<ReadingIter>;

    /// Drop readings older than `older_than`; returns how many were removed
    fn prune(&self, older_than: DateTime<Utc>) -> Result<usize>;

    /// Every sensor id with at least one stored reading
    fn sensor_ids(&self) -> Result<Vec<String>>;
}

/// One sensor's timeline keyed by sample time
#[derive(Default)]
struct Timeline {
    points: BTreeMap<DateTime<Utc>, SensorReading>,
}

impl Timeline {
    fn insert(&mut self, reading: SensorReading, cap: usize) -> bool {
        if self.points.contains_key(&reading.timestamp) {
            return false;
        }
        self.points.insert(reading.timestamp, reading);
        while self.points.len() > cap {
            self.points.pop_first();
        }
        true
    }
}

/// Bounded in-memory history with per-sensor locking
pub struct InMemoryHistoryStore {
    series: RwLock<HashMap<String, Arc<Mutex<Timeline>>>>,
    max_points_per_sensor: usize,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::with_capacity(limits::MAX_POINTS_PER_SENSOR)
    }

    /// Store keeping at most `max_points_per_sensor` readings per sensor
    pub fn with_capacity(max_points_per_sensor: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            max_points_per_sensor: max_points_per_sensor.max(1),
        }
    }

    fn timeline(&self, sensor_id: &str) -> Option<Arc<Mutex<Timeline>>> {
        self.series.read().get(sensor_id).cloned()
    }

    /// Number of readings stored for a sensor
    pub fn len(&self, sensor_id: &str) -> usize {
        self.timeline(sensor_id).map(|t| t.lock().points.len()).unwrap_or(0)
    }
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn append(&self, reading: SensorReading) -> Result<()> {
        let sensor_id = reading.sensor_id.clone();
        let timestamp = reading.timestamp;

        // Series guard stays held until the insert lands
        let inserted = {
            let series = self.series.read();
            match series.get(&sensor_id) {
                Some(timeline) => timeline.lock().insert(reading, self.max_points_per_sensor),
                None => {
                    drop(series);
                    self.series
                        .write()
                        .entry(sensor_id.clone())
                        .or_default()
                        .lock()
                        .insert(reading, self.max_points_per_sensor)
                }
            }
        };

        if !inserted {
            debug!(sensor = %sensor_id, %timestamp, "Duplicate reading ignored");
        }
        Ok(())
    }

    fn latest(&self, sensor_id: &str) -> Result<Option<SensorReading>> {
        Ok(self
            .timeline(sensor_id)
            .and_then(|t| t.lock().points.values().next_back().cloned()))
    }

    fn window(&self, sensor_id: &str, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<ReadingIter> {
        if since > until {
            return Ok(Box::new(std::iter::empty()));
        }
        let points: Vec<SensorReading> = match self.timeline(sensor_id) {
            Some(t) => t.lock().points.range(since..=until).map(|(_, r)| r.clone()).collect(),
            None => Vec::new(),
        };
        Ok(Box::new(points.into_iter()))
    }

    fn prune(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let timelines: Vec<Arc<Mutex<Timeline>>> = self.series.read().values().cloned().collect();
        let mut removed = 0;
        for timeline in timelines {
            let mut guard = timeline.lock();
            let kept = guard.points.split_off(&older_than);
            removed += guard.points.len();
            guard.points = kept;
        }

        // Forget sensors with nothing left
        self.series.write().retain(|_, t| !t.lock().points.is_empty());

        Ok(removed)
    }

    fn sensor_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.series.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
