//! Simulated quote source
//!
//! Random-walk prices with configurable latency, failure rate and bias.
//! Used by the binary when no external feeds are wired in, and by tests
//! that need a moving market.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::oracle::sources::QuoteSource;
use crate::types::{AssetId, Quote};

#[derive(Debug, Clone, Deserialize)]
pub struct SimulatedSourceConfig {
    pub name: String,
    /// Starting price per asset; assets not listed start at 100.0
    #[serde(default)]
    pub base_prices: HashMap<String, f64>,
    /// Relative std dev of each random-walk step (0.001 = 10 bps)
    #[serde(default = "default_step")]
    pub step: f64,
    /// Constant relative offset applied to every quote
    #[serde(default)]
    pub bias: f64,
    /// Probability in [0, 1] that a call fails
    #[serde(default)]
    pub failure_rate: f64,
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,
}

fn default_step() -> f64 {
    0.001
}

fn default_latency_ms() -> u64 {
    25
}

impl SimulatedSourceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_prices: HashMap::new(),
            step: default_step(),
            bias: 0.0,
            failure_rate: 0.0,
            latency_ms: default_latency_ms(),
        }
    }
}

pub struct SimulatedSource {
    config: SimulatedSourceConfig,
    prices: Mutex<HashMap<AssetId, f64>>,
}

impl SimulatedSource {
    pub fn new(config: SimulatedSourceConfig) -> Self {
        Self {
            config,
            prices: Mutex::new(HashMap::new()),
        }
    }

    /// Advance the walk for `asset` and return the new mid, or `None` on a simulated failure
    fn next_price(&self, asset: &AssetId) -> Option<f64> {
        let mut rng = rand::thread_rng();
        if rng.gen::<f64>() < self.config.failure_rate {
            return None;
        }

        let base = self
            .config
            .base_prices
            .get(asset.as_str())
            .copied()
            .unwrap_or(100.0);
        let mut prices = self.prices.lock().unwrap_or_else(|p| p.into_inner());
        let price = prices.entry(asset.clone()).or_insert(base);
        // Box-Muller normal step
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        *price = (*price * (1.0 + self.config.step * z)).max(f64::EPSILON);
        Some(*price * (1.0 + self.config.bias))
    }
}

#[async_trait]
impl QuoteSource for SimulatedSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn get_price(&self, asset: &AssetId, deadline: Instant) -> Result<Quote> {
        let started = Instant::now();
        let ready_at = started + Duration::from_millis(self.config.latency_ms);
        if ready_at > deadline {
            tokio::time::sleep_until(deadline).await;
            bail!("{} timed out", self.config.name);
        }
        tokio::time::sleep_until(ready_at).await;

        let Some(mid) = self.next_price(asset) else {
            bail!("{} returned an error response", self.config.name);
        };
        let price = Decimal::from_f64(mid)
            .map(|p| p.round_dp(8))
            .ok_or_else(|| {
                anyhow::anyhow!("{} produced unrepresentable price {}", self.config.name, mid)
            })?;

        Ok(Quote {
            source: self.config.name.clone(),
            asset: asset.clone(),
            price,
            observed_at: Utc::now(),
            latency: started.elapsed(),
        })
    }
}
