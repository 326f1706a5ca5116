//! Update policy - process-wide tuning read by every component each cycle
//!
//! The policy is swapped as a whole: a candidate is validated first and only
//! replaces the live copy when every field passes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePolicy {
    /// Tick period of the cycle driver
    pub update_interval: Duration,
    /// Minimum quotes that must survive validation and outlier removal
    pub min_source_count: usize,
    /// Quotes further than this many (robust) std devs from the median are dropped
    pub outlier_threshold_std_devs: f64,
    /// Relative move between consecutive estimates that raises a deviation alert (0.1 = 10%)
    pub deviation_alert_threshold: f64,
    /// Quotes and estimates older than this are stale
    pub max_data_age: Duration,
    /// Process noise variance added per second of elapsed time
    pub process_noise_base: f64,
    /// Measurement noise variance at full confidence
    pub measurement_noise_base: f64,
    /// Track velocity and acceleration alongside price
    pub multi_state_enabled: bool,
    /// Weight quotes by inverse latency in addition to trust weight
    pub latency_weighting: bool,
    /// Per-source trust weights; unlisted sources weigh 1.0
    pub source_weights: HashMap<String, f64>,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(5),
            min_source_count: 3,
            outlier_threshold_std_devs: 3.0,
            deviation_alert_threshold: 0.1,
            max_data_age: Duration::from_secs(300),
            process_noise_base: 0.05,
            measurement_noise_base: 0.1,
            multi_state_enabled: false,
            latency_weighting: false,
            source_weights: HashMap::new(),
        }
    }
}

impl UpdatePolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.min_source_count == 0 {
            return Err(PolicyError::ZeroSourceCount);
        }
        check_duration("update_interval", self.update_interval)?;
        check_duration("max_data_age", self.max_data_age)?;
        check_positive("outlier_threshold_std_devs", self.outlier_threshold_std_devs)?;
        check_positive("deviation_alert_threshold", self.deviation_alert_threshold)?;
        check_positive("process_noise_base", self.process_noise_base)?;
        check_positive("measurement_noise_base", self.measurement_noise_base)?;

        for (name, weight) in &self.source_weights {
            if !(weight.is_finite() && *weight > 0.0) {
                return Err(PolicyError::InvalidSourceWeight {
                    name: name.clone(),
                    weight: *weight,
                });
            }
        }
        Ok(())
    }

    /// Trust weight for a source (1.0 when unset)
    pub fn source_weight(&self, source: &str) -> f64 {
        self.source_weights.get(source).copied().unwrap_or(1.0)
    }
}

fn check_positive(field: &'static str, value: f64) -> Result<(), PolicyError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(PolicyError::NotPositive {
            field,
            value: value.to_string(),
        })
    }
}

fn check_duration(field: &'static str, value: Duration) -> Result<(), PolicyError> {
    if value.is_zero() {
        Err(PolicyError::NotPositive {
            field,
            value: format!("{:?}", value),
        })
    } else {
        Ok(())
    }
}

/// Shared, hot-swappable handle to the live policy.
///
/// Readers take a snapshot (`current()`) at the start of a cycle and use it
/// for the whole cycle; the next cycle picks up any swap.
#[derive(Debug, Clone)]
pub struct PolicyHandle {
    inner: Arc<RwLock<Arc<UpdatePolicy>>>,
}

impl PolicyHandle {
    pub fn new(policy: UpdatePolicy) -> Result<Self, PolicyError> {
        policy.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(policy))),
        })
    }

    pub fn current(&self) -> Arc<UpdatePolicy> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the live policy; on error nothing changes.
    pub fn update(&self, policy: UpdatePolicy) -> Result<(), PolicyError> {
        policy.validate()?;
        let policy = Arc::new(policy);
        match self.inner.write() {
            Ok(mut guard) => *guard = policy,
            Err(poisoned) => *poisoned.into_inner() = policy,
        }
        tracing::info!("update policy swapped");
        Ok(())
    }
}

impl Default for PolicyHandle {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(UpdatePolicy::default()))),
        }
    }
}
