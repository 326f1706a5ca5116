//! Configuration section types

use serde::Deserialize;
use std::collections::HashMap;

use crate::oracle::sources::SimulatedSourceConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Asset identifiers to track (e.g. "BTC/USD")
    pub assets: Vec<String>,
    /// Per-source deadline for one fetch, in milliseconds
    pub source_timeout_ms: u64,
    /// Emit JSON logs instead of compact text
    pub json_logs: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    pub update_interval_ms: u64,
    pub min_source_count: usize,
    pub outlier_threshold_std_devs: f64,
    /// Relative move between estimates that raises an alert (0.1 = 10%)
    pub deviation_alert_threshold: f64,
    pub max_data_age_ms: u64,
    pub process_noise_base: f64,
    pub measurement_noise_base: f64,
    pub multi_state_enabled: bool,
    pub latency_weighting: bool,
    /// Per-source trust weights; unlisted sources weigh 1.0
    #[serde(default)]
    pub source_weights: HashMap<String, f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourcesConfig {
    #[serde(default)]
    pub simulated: Vec<SimulatedSourceConfig>,
}

impl SourcesConfig {
    /// Configured simulated sources, or four unbiased ones when none are listed
    pub fn simulated_or_default(&self) -> Vec<SimulatedSourceConfig> {
        if !self.simulated.is_empty() {
            return self.simulated.clone();
        }
        ["sim-alpha", "sim-beta", "sim-gamma", "sim-delta"]
            .into_iter()
            .map(SimulatedSourceConfig::new)
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory
    pub data_dir: String,
    /// Append every estimate to per-asset CSV files
    pub csv_enabled: bool,
    /// History older than this is pruned; 0 keeps everything
    pub history_retention_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    /// Log estimates with a digest reference instead of submitting them
    pub dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Bounded queue length per subscriber
    pub queue_capacity: usize,
}
