//! State estimator - per-asset Kalman-style price filter
//!
//! State-space model:
//! - State: x = [price] or, with multi-state tracking, [price, velocity, acceleration]
//! - Transition: constant velocity / constant acceleration over elapsed seconds
//! - Observation: z = price + noise, noise variance inversely proportional to
//!   the cycle's consensus confidence
//!
//! Process noise grows with elapsed time and with the asset's recent relative
//! innovation size, so fast-moving assets get wider predicted uncertainty.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ndarray::{Array1, Array2};

use crate::error::CycleError;
use crate::policy::UpdatePolicy;

/// Floor on confidence when deriving measurement noise
const MIN_CONFIDENCE: f64 = 0.05;
/// EWMA weight of the newest innovation in the volatility estimate
const VOLATILITY_ALPHA: f64 = 0.1;
/// A 1% average innovation doubles process noise
const VOLATILITY_GAIN: f64 = 100.0;

/// Filter state for one asset
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorState {
    x: Array1<f64>,
    covariance: Array2<f64>,
    last_updated: DateTime<Utc>,
    /// EWMA of |innovation| / price
    volatility: f64,
}

impl EstimatorState {
    fn initialize(measurement: f64, observed_at: DateTime<Utc>, policy: &UpdatePolicy) -> Self {
        let dim = state_dim(policy);
        let mut x = Array1::<f64>::zeros(dim);
        x[0] = measurement;
        Self {
            x,
            covariance: Array2::<f64>::eye(dim) * policy.measurement_noise_base,
            last_updated: observed_at,
            volatility: 0.0,
        }
    }

    pub fn position(&self) -> f64 {
        self.x[0]
    }

    pub fn velocity(&self) -> Option<f64> {
        self.x.get(1).copied()
    }

    pub fn acceleration(&self) -> Option<f64> {
        self.x.get(2).copied()
    }

    pub fn covariance(&self) -> &Array2<f64> {
        &self.covariance
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    pub fn volatility(&self) -> f64 {
        self.volatility
    }

    /// Match the state dimension to the current policy after a toggle.
    fn reshape(&mut self, policy: &UpdatePolicy) {
        let dim = state_dim(policy);
        let current = self.x.len();
        if dim == current {
            return;
        }
        let mut x = Array1::<f64>::zeros(dim);
        let mut p = Array2::<f64>::eye(dim) * policy.measurement_noise_base;
        let keep = dim.min(current);
        for i in 0..keep {
            x[i] = self.x[i];
            for j in 0..keep {
                p[[i, j]] = self.covariance[[i, j]];
            }
        }
        tracing::debug!(from = current, to = dim, "estimator state reshaped");
        self.x = x;
        self.covariance = p;
    }

    /// Advance state and inflate covariance over `dt` seconds.
    fn predict(&mut self, dt: f64, policy: &UpdatePolicy) {
        let dim = self.x.len();
        let mut f = Array2::<f64>::eye(dim);
        if dim == 3 {
            f[[0, 1]] = dt;
            f[[0, 2]] = 0.5 * dt * dt;
            f[[1, 2]] = dt;
        }

        let q = policy.process_noise_base * dt * (1.0 + VOLATILITY_GAIN * self.volatility);
        self.x = f.dot(&self.x);
        self.covariance = f.dot(&self.covariance).dot(&f.t()) + Array2::<f64>::eye(dim) * q;
    }

    /// Blend `measurement` into the predicted state.
    fn update(&mut self, measurement: f64, confidence: f64, policy: &UpdatePolicy) {
        let r = policy.measurement_noise_base / confidence.max(MIN_CONFIDENCE);
        let innovation = measurement - self.x[0];
        let s = self.covariance[[0, 0]] + r;
        let gain: Array1<f64> = self.covariance.column(0).to_owned() / s;

        self.x = &self.x + &(&gain * innovation);

        // P = (I - K H) P, with H selecting the price component
        let h_p = self.covariance.row(0).to_owned();
        let dim = self.x.len();
        let mut correction = Array2::<f64>::zeros((dim, dim));
        for i in 0..dim {
            for j in 0..dim {
                correction[[i, j]] = gain[i] * h_p[j];
            }
        }
        self.covariance = &self.covariance - &correction;
        // Keep P symmetric against rounding drift
        self.covariance = (&self.covariance + &self.covariance.t()) * 0.5;

        if measurement != 0.0 {
            let relative = (innovation / measurement).abs();
            self.volatility = VOLATILITY_ALPHA * relative + (1.0 - VOLATILITY_ALPHA) * self.volatility;
        }
    }
}

fn state_dim(policy: &UpdatePolicy) -> usize {
    if policy.multi_state_enabled {
        3
    } else {
        1
    }
}

/// Output of one filter step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Filtered {
    pub price: f64,
    /// Timestamp the state now refers to (strictly after the previous one)
    pub observed_at: DateTime<Utc>,
    /// Posterior price variance
    pub variance: f64,
}

/// Per-asset filter: Uninitialized until the first measurement, Tracking afterwards.
#[derive(Debug, Clone, Default)]
pub struct StateEstimator {
    state: Option<EstimatorState>,
}

impl StateEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_tracking(&self) -> bool {
        self.state.is_some()
    }

    pub fn state(&self) -> Option<&EstimatorState> {
        self.state.as_ref()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.state.as_ref().map(|s| s.last_updated)
    }

    /// Clamp the tracked price into `[low, high]` so the filter continues from
    /// the value actually published. Returns the resulting position.
    pub fn constrain(&mut self, low: f64, high: f64) -> Option<f64> {
        let state = self.state.as_mut()?;
        if low <= high {
            state.x[0] = state.x[0].clamp(low, high);
        }
        Some(state.position())
    }

    /// Run predict + update for one raw measurement.
    ///
    /// `observed_at` is advanced to at least one microsecond past the previous
    /// update so per-asset timestamps are strictly increasing.
    pub fn observe(
        &mut self,
        measurement: f64,
        confidence: f64,
        observed_at: DateTime<Utc>,
        policy: &UpdatePolicy,
    ) -> Result<Filtered, CycleError> {
        if !(measurement.is_finite() && measurement > 0.0) {
            return Err(CycleError::InvalidMeasurement(format!(
                "raw measurement {} is not a positive finite price",
                measurement
            )));
        }

        let Some(state) = self.state.as_mut() else {
            let state = EstimatorState::initialize(measurement, observed_at, policy);
            let filtered = Filtered {
                price: state.position(),
                observed_at,
                variance: state.covariance[[0, 0]],
            };
            self.state = Some(state);
            return Ok(filtered);
        };

        let observed_at = observed_at.max(state.last_updated + ChronoDuration::microseconds(1));
        let dt = (observed_at - state.last_updated)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        state.reshape(policy);
        state.predict(dt, policy);
        state.update(measurement, confidence, policy);
        state.last_updated = observed_at;

        if !(state.position().is_finite() && state.position() > 0.0) {
            tracing::warn!(
                position = state.position(),
                measurement,
                "filter diverged, re-initializing at measurement"
            );
            *state = EstimatorState::initialize(measurement, observed_at, policy);
        }

        Ok(Filtered {
            price: state.position(),
            observed_at,
            variance: state.covariance[[0, 0]],
        })
    }
}
