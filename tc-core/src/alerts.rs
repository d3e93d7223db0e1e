//! Alert state machine
//!
//! Alerts move `Active -> Acknowledged -> Resolved`, or straight from
//! `Active` to `Resolved` when the condition clears first. `Resolved` is
//! terminal: a new breach opens a new alert.
//!
//! At most one open (Active or Acknowledged) alert exists per
//! `(source, condition)`. Repeated triggers update that alert in place.
//!
//! Every transition is reported to an [`AlertSink`] after the book lock is
//! released. Delivery results never feed back into alert state.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::{limits, sources};
use crate::data::{FanState, FanStatus, SensorReading, SensorStatus, SensorThresholds};
use crate::ingest::classify;
use tc_error::{Result, ThermalError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Some(AlertSeverity::Info),
            "warning" => Some(AlertSeverity::Warning),
            "critical" => Some(AlertSeverity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Some(AlertStatus::Active),
            "acknowledged" => Some(AlertStatus::Acknowledged),
            "resolved" => Some(AlertStatus::Resolved),
            _ => None,
        }
    }
}

/// What kind of breach an alert is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
    /// Sensor above its warning or critical threshold
    Overtemperature,
    /// Fan-bound sensor has no usable reading
    SensorUnavailable,
    /// Fan actuation failing or speed mismatch
    FanFault,
    /// History store unreachable for a whole cycle
    StoreUnavailable,
}

impl AlertCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCondition::Overtemperature => "overtemperature",
            AlertCondition::SensorUnavailable => "sensor_unavailable",
            AlertCondition::FanFault => "fan_fault",
            AlertCondition::StoreUnavailable => "store_unavailable",
        }
    }
}

/// Structured context of the latest breach
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDetails {
    pub threshold: Option<f64>,
    pub observed: Option<f64>,
    /// Number of triggers folded into this alert
    pub occurrences: u32,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: Uuid,
    /// Sensor id, fan id or `control-loop`
    pub source: String,
    pub condition: AlertCondition,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub message: String,
    pub details: AlertDetails,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub note: Option<String>,
}

impl Alert {
    pub fn is_open(&self) -> bool {
        self.status != AlertStatus::Resolved
    }
}

/// A detected breach, before dedup
#[derive(Debug, Clone, PartialEq)]
pub struct AlertTrigger {
    pub source: String,
    pub condition: AlertCondition,
    pub severity: AlertSeverity,
    pub message: String,
    pub threshold: Option<f64>,
    pub observed: Option<f64>,
}

/// Lifecycle notifications for the outside world
#[derive(Debug, Clone, PartialEq)]
pub enum AlertEvent {
    Triggered(Alert),
    /// Severity of an open alert changed
    Escalated { alert: Alert, previous: AlertSeverity },
    Acknowledged(Alert),
    Resolved(Alert),
}

impl AlertEvent {
    pub fn alert(&self) -> &Alert {
        match self {
            AlertEvent::Triggered(a)
            | AlertEvent::Escalated { alert: a, .. }
            | AlertEvent::Acknowledged(a)
            | AlertEvent::Resolved(a) => a,
        }
    }
}

/// Receives alert events (email/webhook dispatchers live behind this)
pub trait AlertSink: Send + Sync {
    fn notify(&self, event: &AlertEvent);
}

/// Sink that only logs
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn notify(&self, event: &AlertEvent) {
        let a = event.alert();
        match event {
            AlertEvent::Triggered(_) => warn!(
                alert = %a.alert_id,
                source = %a.source,
                condition = a.condition.as_str(),
                severity = a.severity.as_str(),
                "Alert triggered: {}", a.message
            ),
            AlertEvent::Escalated { previous, .. } => warn!(
                alert = %a.alert_id,
                source = %a.source,
                from = previous.as_str(),
                to = a.severity.as_str(),
                "Alert severity changed: {}", a.message
            ),
            AlertEvent::Acknowledged(_) => info!(
                alert = %a.alert_id,
                by = a.acknowledged_by.as_deref().unwrap_or(""),
                "Alert acknowledged"
            ),
            AlertEvent::Resolved(_) => info!(
                alert = %a.alert_id,
                source = %a.source,
                by = a.resolved_by.as_deref().unwrap_or(""),
                "Alert resolved"
            ),
        }
    }
}

type OpenKey = (String, AlertCondition);

#[derive(Default)]
struct AlertBook {
    alerts: HashMap<Uuid, Alert>,
    open: HashMap<OpenKey, Uuid>,
    /// Resolved ids, oldest first
    resolved: VecDeque<Uuid>,
}

impl AlertBook {
    fn retire(&mut self, id: Uuid, max_resolved: usize) {
        self.resolved.push_back(id);
        while self.resolved.len() > max_resolved {
            if let Some(old) = self.resolved.pop_front() {
                self.alerts.remove(&old);
            }
        }
    }
}

/// Owns every alert record
pub struct AlertManager {
    book: Mutex<AlertBook>,
    sink: Arc<dyn AlertSink>,
    max_resolved: usize,
}

impl AlertManager {
    pub fn new(sink: Arc<dyn AlertSink>) -> Self {
        Self::with_retention(sink, limits::MAX_RESOLVED_ALERTS)
    }

    /// Manager keeping at most `max_resolved` resolved alerts
    pub fn with_retention(sink: Arc<dyn AlertSink>, max_resolved: usize) -> Self {
        Self {
            book: Mutex::new(AlertBook::default()),
            sink,
            max_resolved,
        }
    }

    /// Open a new alert or fold the trigger into the open one
    pub fn trigger(&self, trigger: AlertTrigger) -> Alert {
        let now = Utc::now();
        let key = (trigger.source.clone(), trigger.condition);

        let (alert, event) = {
            let mut book = self.book.lock();
            let existing = book.open.get(&key).copied();

            match existing.and_then(|id| book.alerts.get_mut(&id)) {
                Some(alert) => {
                    let previous = alert.severity;
                    alert.severity = trigger.severity;
                    alert.message = trigger.message;
                    alert.details.threshold = trigger.threshold;
                    alert.details.observed = trigger.observed;
                    alert.details.occurrences = alert.details.occurrences.saturating_add(1);
                    alert.details.last_seen = now;
                    alert.updated_at = now;

                    let event = (previous != alert.severity).then(|| AlertEvent::Escalated {
                        alert: alert.clone(),
                        previous,
                    });
                    (alert.clone(), event)
                }
                None => {
                    let alert = Alert {
                        alert_id: Uuid::new_v4(),
                        source: trigger.source,
                        condition: trigger.condition,
                        severity: trigger.severity,
                        status: AlertStatus::Active,
                        message: trigger.message,
                        details: AlertDetails {
                            threshold: trigger.threshold,
                            observed: trigger.observed,
                            occurrences: 1,
                            last_seen: now,
                        },
                        created_at: now,
                        updated_at: now,
                        acknowledged_at: None,
                        acknowledged_by: None,
                        resolved_at: None,
                        resolved_by: None,
                        note: None,
                    };
                    book.open.insert(key, alert.alert_id);
                    book.alerts.insert(alert.alert_id, alert.clone());
                    (alert.clone(), Some(AlertEvent::Triggered(alert)))
                }
            }
        };

        match event {
            Some(event) => self.sink.notify(&event),
            None => debug!(alert = %alert.alert_id, occurrences = alert.details.occurrences, "Alert updated"),
        }
        alert
    }

    /// Auto-resolve the open alert for `(source, condition)`, if any
    pub fn clear(&self, source: &str, condition: AlertCondition) -> Option<Alert> {
        let resolved = {
            let mut book = self.book.lock();
            let id = book.open.remove(&(source.to_string(), condition))?;
            let now = Utc::now();
            let alert = book.alerts.get_mut(&id)?;
            alert.status = AlertStatus::Resolved;
            alert.resolved_at = Some(now);
            alert.resolved_by = Some(sources::CONTROL_LOOP.to_string());
            alert.note = Some("condition cleared".to_string());
            alert.updated_at = now;
            let snapshot = alert.clone();
            book.retire(id, self.max_resolved);
            snapshot
        };

        self.sink.notify(&AlertEvent::Resolved(resolved.clone()));
        Some(resolved)
    }

    /// Operator acknowledgement; only valid from Active
    pub fn acknowledge(&self, alert_id: Uuid, who: &str, note: Option<String>) -> Result<Alert> {
        let acknowledged = {
            let mut book = self.book.lock();
            let alert = book
                .alerts
                .get_mut(&alert_id)
                .ok_or_else(|| ThermalError::AlertNotFound(alert_id.to_string()))?;

            if alert.status != AlertStatus::Active {
                return Err(invalid_transition(alert, "acknowledge"));
            }

            let now = Utc::now();
            alert.status = AlertStatus::Acknowledged;
            alert.acknowledged_at = Some(now);
            alert.acknowledged_by = Some(who.to_string());
            if note.is_some() {
                alert.note = note;
            }
            alert.updated_at = now;
            alert.clone()
        };

        self.sink.notify(&AlertEvent::Acknowledged(acknowledged.clone()));
        Ok(acknowledged)
    }

    /// Operator resolution; valid from Active or Acknowledged
    pub fn resolve(&self, alert_id: Uuid, who: &str, note: Option<String>) -> Result<Alert> {
        let resolved = {
            let mut book = self.book.lock();
            let alert = book
                .alerts
                .get_mut(&alert_id)
                .ok_or_else(|| ThermalError::AlertNotFound(alert_id.to_string()))?;

            if alert.status == AlertStatus::Resolved {
                return Err(invalid_transition(alert, "resolve"));
            }

            let now = Utc::now();
            alert.status = AlertStatus::Resolved;
            alert.resolved_at = Some(now);
            alert.resolved_by = Some(who.to_string());
            if note.is_some() {
                alert.note = note;
            }
            alert.updated_at = now;
            let snapshot = alert.clone();

            book.open.remove(&(snapshot.source.clone(), snapshot.condition));
            book.retire(alert_id, self.max_resolved);
            snapshot
        };

        self.sink.notify(&AlertEvent::Resolved(resolved.clone()));
        Ok(resolved)
    }

    pub fn get(&self, alert_id: Uuid) -> Option<Alert> {
        self.book.lock().alerts.get(&alert_id).cloned()
    }

    /// Alerts matching the filters, newest first
    pub fn list(&self, status: Option<AlertStatus>, severity: Option<AlertSeverity>) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .book
            .lock()
            .alerts
            .values()
            .filter(|a| status.map_or(true, |s| a.status == s))
            .filter(|a| severity.map_or(true, |s| a.severity == s))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        alerts
    }

    pub fn open_count(&self) -> usize {
        self.book.lock().open.len()
    }

    /// Replace the book with previously persisted alerts
    pub fn restore(&self, alerts: Vec<Alert>) {
        let mut book = AlertBook::default();

        let mut resolved: Vec<&Alert> = alerts.iter().filter(|a| !a.is_open()).collect();
        resolved.sort_by_key(|a| a.resolved_at.unwrap_or(a.updated_at));
        let resolved_ids: Vec<Uuid> = resolved.iter().map(|a| a.alert_id).collect();

        for alert in &alerts {
            if alert.is_open() {
                let key = (alert.source.clone(), alert.condition);
                if let Some(prev) = book.open.insert(key, alert.alert_id) {
                    warn!(alert = %prev, "Dropping duplicate open alert from snapshot");
                    book.alerts.remove(&prev);
                }
            }
            book.alerts.insert(alert.alert_id, alert.clone());
        }
        for id in resolved_ids {
            book.retire(id, self.max_resolved);
        }

        debug!(alerts = book.alerts.len(), open = book.open.len(), "Restored alerts");
        *self.book.lock() = book;
    }

    /// Re-evaluate a sensor's overtemperature alert against its thresholds
    pub fn observe_reading(&self, reading: &SensorReading, thresholds: Option<SensorThresholds>) {
        let status = classify(reading.value, thresholds);
        match (status, thresholds) {
            (SensorStatus::Normal, _) | (_, None) => {
                self.clear(&reading.sensor_id, AlertCondition::Overtemperature);
            }
            (level, Some(t)) => {
                let (severity, threshold, label) = if level == SensorStatus::Critical {
                    (AlertSeverity::Critical, t.critical_threshold, "critical")
                } else {
                    (AlertSeverity::Warning, t.warning_threshold, "warning")
                };
                self.trigger(AlertTrigger {
                    source: reading.sensor_id.clone(),
                    condition: AlertCondition::Overtemperature,
                    severity,
                    message: format!(
                        "{} at {:.1}°C exceeds {} threshold {:.1}°C",
                        reading.sensor_id, reading.value, label, threshold
                    ),
                    threshold: Some(threshold),
                    observed: Some(reading.value),
                });
            }
        }
    }

    /// Raise or clear the unavailable alert for a fan-bound sensor
    pub fn observe_sensor_availability(&self, sensor_id: &str, available: bool, reason: &str) {
        if available {
            self.clear(sensor_id, AlertCondition::SensorUnavailable);
        } else {
            self.trigger(AlertTrigger {
                source: sensor_id.to_string(),
                condition: AlertCondition::SensorUnavailable,
                severity: AlertSeverity::Warning,
                message: format!("{} has no usable reading: {}", sensor_id, reason),
                threshold: None,
                observed: None,
            });
        }
    }

    /// Mirror a fan's actuation health into its fault alert
    pub fn observe_fan(&self, fan: &FanState) {
        let severity = match fan.status {
            FanStatus::Normal => {
                self.clear(&fan.fan_id, AlertCondition::FanFault);
                return;
            }
            FanStatus::Warning => AlertSeverity::Warning,
            FanStatus::Error => AlertSeverity::Critical,
        };

        let message = match fan.speed_rpm {
            Some(rpm) => format!(
                "{} is {} (commanded {}%, observed {} RPM)",
                fan.fan_id,
                fan.status.as_str(),
                fan.speed_percent,
                rpm
            ),
            None => format!("{} is {} (commanded {}%)", fan.fan_id, fan.status.as_str(), fan.speed_percent),
        };

        self.trigger(AlertTrigger {
            source: fan.fan_id.clone(),
            condition: AlertCondition::FanFault,
            severity,
            message,
            threshold: None,
            observed: fan.speed_rpm.map(f64::from),
        });
    }

    /// Raise or clear the loop-wide store alert
    pub fn observe_store(&self, degraded: bool) {
        if degraded {
            self.trigger(AlertTrigger {
                source: sources::CONTROL_LOOP.to_string(),
                condition: AlertCondition::StoreUnavailable,
                severity: AlertSeverity::Critical,
                message: "History store unreachable, all automatic fans at fail-safe speed".to_string(),
                threshold: None,
                observed: None,
            });
        } else {
            self.clear(sources::CONTROL_LOOP, AlertCondition::StoreUnavailable);
        }
    }
}

fn invalid_transition(alert: &Alert, action: &str) -> ThermalError {
    ThermalError::InvalidTransition {
        alert_id: alert.alert_id.to_string(),
        from: alert.status.as_str().to_string(),
        action: action.to_string(),
    }
}
