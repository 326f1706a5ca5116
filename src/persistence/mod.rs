//! Estimate persistence
//!
//! `PriceStore` is the storage contract the cycle driver writes through:
//! a "current" slot per asset plus an append-only, time-ordered history.
//! `MemoryPriceStore` is the authoritative in-process implementation;
//! `CsvPriceStore` layers durable CSV appends on top of it.

mod csv_store;

pub use csv_store::{CsvPriceStore, EstimateRecord};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::{AssetId, Estimate};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Overwrite the current slot for the asset and append to its history.
    async fn save_price(&self, estimate: &Estimate) -> Result<()>;

    async fn get_price(&self, asset: &AssetId) -> Result<Option<Estimate>>;

    /// History entries with `start < observed_at < end`, oldest first.
    async fn get_price_history(
        &self,
        asset: &AssetId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Estimate>>;

    /// Remove history entries observed at `timestamp`. Returns how many were removed.
    async fn delete_price(&self, asset: &AssetId, timestamp: DateTime<Utc>) -> Result<usize>;
}

#[derive(Debug, Default)]
struct AssetSeries {
    current: Option<Estimate>,
    history: Vec<Estimate>,
}

/// In-memory store keyed by asset
#[derive(Debug, Default)]
pub struct MemoryPriceStore {
    series: RwLock<HashMap<AssetId, AssetSeries>>,
}

impl MemoryPriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of history entries held for `asset`
    pub fn history_len(&self, asset: &AssetId) -> usize {
        self.series
            .read()
            .map(|s| s.get(asset).map(|a| a.history.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    fn insert(&self, estimate: &Estimate) -> Result<()> {
        let mut series = self
            .series
            .write()
            .map_err(|_| anyhow!("price store lock poisoned"))?;
        let entry = series.entry(estimate.asset.clone()).or_default();

        // Ties land after existing entries with the same timestamp
        let at = entry
            .history
            .partition_point(|e| e.observed_at <= estimate.observed_at);
        entry.history.insert(at, estimate.clone());

        let newer_than_current = entry
            .current
            .as_ref()
            .map(|c| estimate.observed_at >= c.observed_at)
            .unwrap_or(true);
        if newer_than_current {
            entry.current = Some(estimate.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl PriceStore for MemoryPriceStore {
    async fn save_price(&self, estimate: &Estimate) -> Result<()> {
        self.insert(estimate)
    }

    async fn get_price(&self, asset: &AssetId) -> Result<Option<Estimate>> {
        let series = self
            .series
            .read()
            .map_err(|_| anyhow!("price store lock poisoned"))?;
        Ok(series.get(asset).and_then(|a| a.current.clone()))
    }

    async fn get_price_history(
        &self,
        asset: &AssetId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Estimate>> {
        let series = self
            .series
            .read()
            .map_err(|_| anyhow!("price store lock poisoned"))?;
        Ok(series
            .get(asset)
            .map(|a| {
                a.history
                    .iter()
                    .filter(|e| e.observed_at > start && e.observed_at < end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_price(&self, asset: &AssetId, timestamp: DateTime<Utc>) -> Result<usize> {
        let mut series = self
            .series
            .write()
            .map_err(|_| anyhow!("price store lock poisoned"))?;
        let Some(entry) = series.get_mut(asset) else {
            return Ok(0);
        };

        let before = entry.history.len();
        entry.history.retain(|e| e.observed_at != timestamp);
        let removed = before - entry.history.len();

        // The current slot only follows a deletion of its own entry
        if entry
            .current
            .as_ref()
            .map(|c| c.observed_at == timestamp)
            .unwrap_or(false)
        {
            entry.current = entry.history.last().cloned();
        }
        if entry.current.is_none() && entry.history.is_empty() {
            series.remove(asset);
        }

        if removed > 0 {
            tracing::debug!(asset = %asset, %timestamp, removed, "history pruned");
        }
        Ok(removed)
    }
}
