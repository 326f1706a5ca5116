//! Configuration management for PriceFeed
//!
//! Loads defaults, optional config files and environment variables via .env

mod types;

pub use types::*;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::policy::UpdatePolicy;
use crate::types::AssetId;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub feed: FeedConfig,
    pub policy: PolicyConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    pub persistence: PersistenceConfig,
    pub publisher: PublisherConfig,
    pub hub: HubConfig,
}

impl AppConfig {
    /// Load configuration from `config/default`, `config/local` and `PRICEFEED__*` env vars
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();
        Self::load_from(&["config/default", "config/local"])
    }

    /// Load with the given optional config files layered over the defaults
    pub fn load_from(files: &[&str]) -> Result<Self> {
        let mut builder = Config::builder()
            // Feed defaults
            .set_default("feed.assets", vec!["BTC/USD", "ETH/USD"])?
            .set_default("feed.source_timeout_ms", 2000)?
            .set_default("feed.json_logs", false)?
            // Policy defaults
            .set_default("policy.update_interval_ms", 5000)?
            .set_default("policy.min_source_count", 3)?
            .set_default("policy.outlier_threshold_std_devs", 3.0)?
            .set_default("policy.deviation_alert_threshold", 0.1)?
            .set_default("policy.max_data_age_ms", 300_000)?
            .set_default("policy.process_noise_base", 0.05)?
            .set_default("policy.measurement_noise_base", 0.1)?
            .set_default("policy.multi_state_enabled", false)?
            .set_default("policy.latency_weighting", false)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.csv_enabled", true)?
            .set_default("persistence.history_retention_secs", 86_400)?
            // Publisher defaults
            .set_default("publisher.dry_run", true)?
            // Hub defaults
            .set_default("hub.queue_capacity", 100)?;

        for file in files {
            builder = builder.add_source(File::with_name(file).required(false));
        }

        let config = builder
            // Override with environment variables (PRICEFEED__*)
            .add_source(Environment::with_prefix("PRICEFEED").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    pub fn assets(&self) -> Vec<AssetId> {
        self.feed.assets.iter().map(AssetId::new).collect()
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.feed.source_timeout_ms)
    }

    pub fn history_retention(&self) -> Option<Duration> {
        match self.persistence.history_retention_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Build and validate the update policy described by this config
    pub fn update_policy(&self) -> Result<UpdatePolicy> {
        let p = &self.policy;
        let policy = UpdatePolicy {
            update_interval: Duration::from_millis(p.update_interval_ms),
            min_source_count: p.min_source_count,
            outlier_threshold_std_devs: p.outlier_threshold_std_devs,
            deviation_alert_threshold: p.deviation_alert_threshold,
            max_data_age: Duration::from_millis(p.max_data_age_ms),
            process_noise_base: p.process_noise_base,
            measurement_noise_base: p.measurement_noise_base,
            multi_state_enabled: p.multi_state_enabled,
            latency_weighting: p.latency_weighting,
            source_weights: p.source_weights.clone(),
        };
        policy.validate().context("Invalid update policy")?;
        Ok(policy)
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "assets={:?} interval_ms={} min_sources={} outlier_sd={:.2} multi_state={} dry_run={} csv={}",
            self.feed.assets,
            self.policy.update_interval_ms,
            self.policy.min_source_count,
            self.policy.outlier_threshold_std_devs,
            self.policy.multi_state_enabled,
            self.publisher.dry_run,
            self.persistence.csv_enabled
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
