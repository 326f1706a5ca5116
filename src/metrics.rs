//! Metrics collector - cycle outcomes, latency and source health
//!
//! Source health is 1.0 after a success and decays by half on every failure,
//! so a flapping source recovers immediately but a dead one trends to zero.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use crate::types::AssetId;

const HEALTH_DECAY: f64 = 0.5;
/// Weight of the newest sample in the rolling latency average
const LATENCY_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_updates: u64,
    pub failed_updates: u64,
    pub failures_by_reason: HashMap<String, u64>,
    pub average_latency_ms: f64,
    pub last_update_time: Option<DateTime<Utc>>,
    pub source_health: HashMap<String, f64>,
    pub publish_failures: u64,
    pub persistence_failures: u64,
    pub dropped_notifications: u64,
    pub last_update_by_asset: HashMap<AssetId, DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct MetricsCollector {
    inner: RwLock<MetricsSnapshot>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<F: FnOnce(&mut MetricsSnapshot)>(&self, f: F) {
        match self.inner.write() {
            Ok(mut m) => f(&mut m),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Record a successful cycle and its end-to-end latency
    pub fn record_update(&self, asset: &AssetId, latency: Duration) {
        let now = Utc::now();
        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.with(|m| {
            m.average_latency_ms = if m.total_updates == 0 {
                latency_ms
            } else {
                LATENCY_ALPHA * latency_ms + (1.0 - LATENCY_ALPHA) * m.average_latency_ms
            };
            m.total_updates += 1;
            m.last_update_time = Some(now);
            m.last_update_by_asset.insert(asset.clone(), now);
        });
    }

    pub fn record_failed_update(&self, asset: &AssetId, reason: &str) {
        tracing::debug!(asset = %asset, reason, "failed update recorded");
        self.with(|m| {
            m.failed_updates += 1;
            *m.failures_by_reason.entry(reason.to_string()).or_insert(0) += 1;
        });
    }

    pub fn record_source_success(&self, source: &str) {
        self.with(|m| {
            m.source_health.insert(source.to_string(), 1.0);
        });
    }

    pub fn record_source_failure(&self, source: &str) {
        self.with(|m| {
            let health = m.source_health.entry(source.to_string()).or_insert(1.0);
            *health *= HEALTH_DECAY;
        });
    }

    pub fn record_publish_failure(&self) {
        self.with(|m| m.publish_failures += 1);
    }

    pub fn record_persistence_failure(&self) {
        self.with(|m| m.persistence_failures += 1);
    }

    pub fn record_dropped_notifications(&self, count: u64) {
        if count > 0 {
            self.with(|m| m.dropped_notifications += count);
        }
    }

    pub fn source_health(&self, source: &str) -> Option<f64> {
        self.snapshot().source_health.get(source).copied()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        match self.inner.read() {
            Ok(m) => m.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_health_decays_and_recovers() {
        let metrics = MetricsCollector::new();
        metrics.record_source_failure("coinbase");
        metrics.record_source_failure("coinbase");
        assert_eq!(metrics.source_health("coinbase"), Some(0.25));

        metrics.record_source_success("coinbase");
        assert_eq!(metrics.source_health("coinbase"), Some(1.0));
    }

    #[test]
    fn test_failed_updates_bucketed_by_reason() {
        let metrics = MetricsCollector::new();
        let asset: AssetId = "BTC".into();
        metrics.record_failed_update(&asset, "insufficient_sources");
        metrics.record_failed_update(&asset, "insufficient_sources");
        metrics.record_failed_update(&asset, "invalid_measurement");

        let snap = metrics.snapshot();
        assert_eq!(snap.failed_updates, 3);
        assert_eq!(snap.failures_by_reason["insufficient_sources"], 2);
    }

    #[test]
    fn test_latency_average_starts_at_first_sample() {
        let metrics = MetricsCollector::new();
        let asset: AssetId = "BTC".into();
        metrics.record_update(&asset, Duration::from_millis(100));
        assert!((metrics.snapshot().average_latency_ms - 100.0).abs() < 1e-9);

        metrics.record_update(&asset, Duration::from_millis(200));
        let snap = metrics.snapshot();
        assert!((snap.average_latency_ms - 120.0).abs() < 1e-9);
        assert_eq!(snap.total_updates, 2);
        assert!(snap.last_update_by_asset.contains_key(&asset));
    }
}
