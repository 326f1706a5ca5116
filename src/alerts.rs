//! Alert Manager - typed, append-only alert log
//!
//! Alerts are raised from the cycle path and from reads. Raising never
//! blocks on anything but the log's own lock and never fails.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::types::AssetId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    PriceDeviation,
    StalePrice,
    DataSourceFailure,
    PublishFailure,
    PersistenceFailure,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertKind::PriceDeviation => write!(f, "PRICE_DEVIATION"),
            AlertKind::StalePrice => write!(f, "STALE_PRICE"),
            AlertKind::DataSourceFailure => write!(f, "DATA_SOURCE_FAILURE"),
            AlertKind::PublishFailure => write!(f, "PUBLISH_FAILURE"),
            AlertKind::PersistenceFailure => write!(f, "PERSISTENCE_FAILURE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub kind: AlertKind,
    pub severity: Severity,
    /// Asset id, or source name for source failures
    pub subject: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct AlertLog {
    events: Vec<AlertEvent>,
    /// Last `lastUpdated` a stale alert was raised for, per asset
    stale_marks: HashMap<AssetId, DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct AlertManager {
    log: Mutex<AlertLog>,
}

impl AlertManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AlertLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(
        &self,
        log: &mut AlertLog,
        kind: AlertKind,
        severity: Severity,
        subject: String,
        payload: serde_json::Value,
    ) {
        tracing::warn!(kind = %kind, subject = %subject, payload = %payload, "alert raised");
        log.events.push(AlertEvent {
            id: Uuid::new_v4(),
            kind,
            severity,
            subject,
            payload,
            timestamp: Utc::now(),
        });
    }

    pub fn alert_price_deviation(&self, asset: &AssetId, previous: Decimal, current: Decimal) {
        let mut log = self.lock();
        self.push(
            &mut log,
            AlertKind::PriceDeviation,
            Severity::Warning,
            asset.to_string(),
            json!({ "previous": previous.to_string(), "current": current.to_string() }),
        );
    }

    /// Raise a stale alert unless one is already on record for this `last_updated`.
    /// Returns whether a new alert was appended.
    pub fn alert_stale_price(&self, asset: &AssetId, last_updated: DateTime<Utc>) -> bool {
        let mut log = self.lock();
        if log.stale_marks.get(asset) == Some(&last_updated) {
            return false;
        }
        log.stale_marks.insert(asset.clone(), last_updated);
        self.push(
            &mut log,
            AlertKind::StalePrice,
            Severity::Warning,
            asset.to_string(),
            json!({ "last_observed_at": last_updated.to_rfc3339() }),
        );
        true
    }

    pub fn alert_data_source_failure(&self, source: &str, reason: &str) {
        let mut log = self.lock();
        self.push(
            &mut log,
            AlertKind::DataSourceFailure,
            Severity::Critical,
            source.to_string(),
            json!({ "reason": reason }),
        );
    }

    pub fn alert_publish_failure(&self, asset: &AssetId, reason: &str) {
        let mut log = self.lock();
        self.push(
            &mut log,
            AlertKind::PublishFailure,
            Severity::Critical,
            asset.to_string(),
            json!({ "reason": reason }),
        );
    }

    pub fn alert_persistence_failure(&self, asset: &AssetId, reason: &str) {
        let mut log = self.lock();
        self.push(
            &mut log,
            AlertKind::PersistenceFailure,
            Severity::Critical,
            asset.to_string(),
            json!({ "reason": reason }),
        );
    }

    /// Snapshot of every alert, oldest first
    pub fn alerts(&self) -> Vec<AlertEvent> {
        self.lock().events.clone()
    }

    pub fn alerts_of(&self, kind: AlertKind) -> Vec<AlertEvent> {
        self.lock()
            .events
            .iter()
            .filter(|a| a.kind == kind)
            .cloned()
            .collect()
    }

    pub fn clear_alerts(&self) {
        let mut log = self.lock();
        log.events.clear();
        log.stale_marks.clear();
    }
}
