//! Sensor reading ingestion
//!
//! Normalizes raw samples into validated [`SensorReading`]s, classifies them
//! against the sensor's thresholds and appends them to the history store.
//! Rejections are logged and returned; nothing here can take down the loop.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::constants::{temperature, timing};
use crate::data::{
    validate_identifier, validate_temperature, ControlPolicyConfig, RawSample, SensorReading,
    SensorStatus, SensorThresholds,
};
use crate::history::HistoryStore;
use tc_error::{Result, ThermalError};

/// Derive a reading's status from its thresholds
pub fn classify(celsius: f64, thresholds: Option<SensorThresholds>) -> SensorStatus {
    match thresholds {
        Some(t) if celsius >= t.critical_threshold => SensorStatus::Critical,
        Some(t) if celsius >= t.warning_threshold => SensorStatus::Warning,
        _ => SensorStatus::Normal,
    }
}

/// Validates samples and writes them to history
pub struct Ingestor {
    store: Arc<dyn HistoryStore>,
    policy: RwLock<Arc<ControlPolicyConfig>>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn HistoryStore>, policy: Arc<ControlPolicyConfig>) -> Self {
        Self {
            store,
            policy: RwLock::new(policy),
        }
    }

    /// Swap the threshold/location source; applies to the next sample
    pub fn set_policy(&self, policy: Arc<ControlPolicyConfig>) {
        *self.policy.write() = policy;
    }

    /// Validate, normalize, classify and store one sample
    pub fn ingest(&self, sample: RawSample) -> Result<SensorReading> {
        let reading = match self.normalize(sample) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Rejected sensor sample");
                return Err(e);
            }
        };

        if let Err(e) = self.store.append(reading.clone()) {
            warn!(sensor = %reading.sensor_id, error = %e, "Failed to store reading");
            return Err(e);
        }

        debug!(
            sensor = %reading.sensor_id,
            celsius = reading.value,
            status = reading.status.as_str(),
            "Ingested reading"
        );
        Ok(reading)
    }

    fn normalize(&self, sample: RawSample) -> Result<SensorReading> {
        let sensor_id = validate_identifier(&sample.sensor_id)?;

        if !sample.value.is_finite() {
            return Err(ThermalError::out_of_range(
                "value",
                sample.value,
                temperature::PHYSICAL_MIN_CELSIUS,
                temperature::PHYSICAL_MAX_CELSIUS,
            ));
        }

        let celsius = validate_temperature("value", sample.unit.to_celsius(sample.value))?;

        // A future sample would shadow every real one as the sensor's latest
        let skew = chrono::Duration::from_std(timing::MAX_CLOCK_SKEW)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let now = Utc::now();
        if sample.timestamp > now + skew {
            return Err(ThermalError::out_of_range(
                "timestamp_ms",
                sample.timestamp.timestamp_millis() as f64,
                0.0,
                (now + skew).timestamp_millis() as f64,
            ));
        }

        let policy = self.policy.read().clone();
        let configured = policy.sensor(&sensor_id);
        let status = classify(celsius, configured.and_then(|s| s.thresholds));
        let location = sample
            .location
            .filter(|l| !l.trim().is_empty())
            .or_else(|| configured.map(|s| s.location.clone()))
            .unwrap_or_default();

        Ok(SensorReading {
            sensor_id,
            value: celsius,
            location,
            status,
            timestamp: sample.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SensorPolicy, TemperatureUnit};
    use crate::history::InMemoryHistoryStore;

    fn policy() -> Arc<ControlPolicyConfig> {
        Arc::new(ControlPolicyConfig {
            sensors: vec![SensorPolicy {
                sensor_id: "GPU_TEMP_1".into(),
                location: "gpu die".into(),
                thresholds: Some(SensorThresholds { warning_threshold: 80.0, critical_threshold: 90.0 }),
            }],
            ..ControlPolicyConfig::default()
        })
    }

    fn ingestor() -> (Arc<InMemoryHistoryStore>, Ingestor) {
        let store = Arc::new(InMemoryHistoryStore::new());
        let ingestor = Ingestor::new(store.clone(), policy());
        (store, ingestor)
    }

    struct FailingStore;

    impl HistoryStore for FailingStore {
        fn append(&self, _: SensorReading) -> Result<()> {
            Err(ThermalError::store("disk full"))
        }
        fn latest(&self, _: &str) -> Result<Option<SensorReading>> {
            Ok(None)
        }
        fn window(
            &self,
            _: &str,
            _: chrono::DateTime<Utc>,
            _: chrono::DateTime<Utc>,
        ) -> Result<crate::history::ReadingIter> {
            Ok(Box::new(std::iter::empty()))
        }
        fn prune(&self, _: chrono::DateTime<Utc>) -> Result<usize> {
            Ok(0)
        }
        fn sensor_ids(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_classification() {
        let (_, ingestor) = ingestor();
        let r = ingestor.ingest(RawSample::celsius("GPU_TEMP_1", 92.0)).unwrap();
        assert_eq!(r.status, SensorStatus::Critical);
        assert_eq!(r.location, "gpu die");

        let r = ingestor.ingest(RawSample::celsius("GPU_TEMP_1", 85.0)).unwrap();
        assert_eq!(r.status, SensorStatus::Warning);

        // No thresholds configured
        let r = ingestor.ingest(RawSample::celsius("CPU_TEMP_1", 140.0)).unwrap();
        assert_eq!(r.status, SensorStatus::Normal);
        assert_eq!(r.location, "");
    }

    #[test]
    fn test_fahrenheit_is_normalized() {
        let (store, ingestor) = ingestor();
        let mut sample = RawSample::celsius("CPU_TEMP_1", 212.0);
        sample.unit = TemperatureUnit::Fahrenheit;
        sample.location = Some("cpu package".into());

        let r = ingestor.ingest(sample).unwrap();
        assert!((r.value - 100.0).abs() < 1e-9);
        assert_eq!(r.location, "cpu package");
        assert_eq!(store.latest("CPU_TEMP_1").unwrap().unwrap(), r);
    }

    #[test]
    fn test_rejects_out_of_range() {
        let (store, ingestor) = ingestor();
        for v in [150.5, -41.0, f64::NAN, f64::INFINITY] {
            let err = ingestor.ingest(RawSample::celsius("CPU_TEMP_1", v)).unwrap_err();
            assert!(matches!(err, ThermalError::OutOfRange { .. }), "{} -> {:?}", v, err);
        }
        // 400 °F is ~204 °C
        let mut sample = RawSample::celsius("CPU_TEMP_1", 400.0);
        sample.unit = TemperatureUnit::Fahrenheit;
        assert!(ingestor.ingest(sample).is_err());

        assert!(store.latest("CPU_TEMP_1").unwrap().is_none());
    }

    #[test]
    fn test_rejects_empty_identifier() {
        let (_, ingestor) = ingestor();
        let err = ingestor.ingest(RawSample::celsius("  ", 40.0)).unwrap_err();
        assert!(matches!(err, ThermalError::InvalidIdentifier { .. }));
    }

    #[test]
    fn test_reingest_is_noop() {
        let (store, ingestor) = ingestor();
        let t = Utc::now();
        ingestor.ingest(RawSample::celsius("CPU_TEMP_1", 55.0).at(t)).unwrap();
        ingestor.ingest(RawSample::celsius("CPU_TEMP_1", 55.0).at(t)).unwrap();
        assert_eq!(store.len("CPU_TEMP_1"), 1);
    }

    #[test]
    fn test_rejects_future_timestamp() {
        let (store, ingestor) = ingestor();
        let now = Utc::now();
        let err = ingestor
            .ingest(RawSample::celsius("GPU_TEMP_1", 30.0).at(now + chrono::Duration::days(365)))
            .unwrap_err();
        assert!(matches!(&err, ThermalError::OutOfRange { field, .. } if field == "timestamp_ms"));

        // Slight skew is tolerated, and a current sample becomes latest
        ingestor.ingest(RawSample::celsius("GPU_TEMP_1", 40.0).at(now + chrono::Duration::seconds(1))).unwrap();
        ingestor.ingest(RawSample::celsius("GPU_TEMP_1", 95.0).at(now + chrono::Duration::seconds(2))).unwrap();
        let latest = store.latest("GPU_TEMP_1").unwrap().unwrap();
        assert_eq!(latest.value, 95.0);
        assert_eq!(latest.status, SensorStatus::Critical);
    }

    #[test]
    fn test_store_error_is_returned() {
        let ingestor = Ingestor::new(Arc::new(FailingStore), policy());
        let err = ingestor.ingest(RawSample::celsius("CPU_TEMP_1", 40.0)).unwrap_err();
        assert_eq!(err.kind(), tc_error::ErrorKind::Storage);
    }

    #[test]
    fn test_policy_swap_changes_thresholds() {
        let (_, ingestor) = ingestor();
        ingestor.set_policy(Arc::new(ControlPolicyConfig::default()));
        let r = ingestor.ingest(RawSample::celsius("GPU_TEMP_1", 95.0)).unwrap();
        assert_eq!(r.status, SensorStatus::Normal);
    }
}
