//! CSV-backed durable store
//!
//! Every saved estimate is appended to `<data_dir>/estimates/<asset>.csv`.
//! Reads are served from the in-memory store, which stays authoritative
//! even when an append fails. Opening the store replays the existing files
//! into memory, so the last estimate and its history survive a restart.
//! Deletes only touch memory; rows pruned from it come back on the next
//! open and are pruned again by the retention pass.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::Mutex;

use super::{MemoryPriceStore, PriceStore};
use crate::types::{AssetId, Estimate};

/// One CSV row per stored estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateRecord {
    /// RFC 3339 with nanoseconds, so distinct estimates never share a row key
    pub timestamp: DateTime<Utc>,
    pub asset: String,
    pub price: String,
    pub confidence: f64,
    pub source_count: usize,
    pub std_dev: String,
    /// Outlier sources joined with ';'
    pub outlier_sources: String,
}

impl From<&Estimate> for EstimateRecord {
    fn from(e: &Estimate) -> Self {
        Self {
            timestamp: e.observed_at,
            asset: e.asset.to_string(),
            price: e.price.to_string(),
            confidence: e.confidence,
            source_count: e.source_count,
            std_dev: e.std_dev.to_string(),
            outlier_sources: e
                .outlier_sources
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(";"),
        }
    }
}

impl TryFrom<EstimateRecord> for Estimate {
    type Error = anyhow::Error;

    fn try_from(r: EstimateRecord) -> Result<Self> {
        Ok(Self {
            asset: r.asset.into(),
            price: Decimal::from_str(&r.price)
                .map_err(|e| anyhow!("bad price {:?}: {}", r.price, e))?,
            confidence: r.confidence,
            source_count: r.source_count,
            std_dev: Decimal::from_str(&r.std_dev)
                .map_err(|e| anyhow!("bad std_dev {:?}: {}", r.std_dev, e))?,
            outlier_sources: r
                .outlier_sources
                .split(';')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            observed_at: r.timestamp,
        })
    }
}

pub struct CsvPriceStore {
    dir: PathBuf,
    memory: MemoryPriceStore,
    writers: Mutex<HashMap<AssetId, csv::Writer<fs::File>>>,
}

impl CsvPriceStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref().join("estimates");
        fs::create_dir_all(&dir).context("Failed to create estimates directory")?;
        let memory = MemoryPriceStore::new();
        let restored = Self::load_existing(&dir, &memory)?;
        if restored > 0 {
            tracing::info!(dir = %dir.display(), restored, "estimates restored from CSV");
        }
        Ok(Self {
            dir,
            memory,
            writers: Mutex::new(HashMap::new()),
        })
    }

    /// Replay every `*.csv` under `dir` into `memory`. Unreadable rows are skipped.
    fn load_existing(dir: &Path, memory: &MemoryPriceStore) -> Result<usize> {
        let mut restored = 0;
        let entries = fs::read_dir(dir)
            .with_context(|| format!("Failed to list {}", dir.display()))?;
        for entry in entries {
            let path = entry.context("Failed to read estimates directory entry")?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }
            let mut reader = ReaderBuilder::new()
                .has_headers(true)
                .from_path(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            for (row, record) in reader.deserialize::<EstimateRecord>().enumerate() {
                let estimate = record
                    .map_err(anyhow::Error::from)
                    .and_then(Estimate::try_from);
                match estimate {
                    Ok(estimate) => {
                        memory.insert(&estimate)?;
                        restored += 1;
                    }
                    Err(e) => tracing::warn!(
                        file = %path.display(),
                        row = row + 1,
                        error = %e,
                        "skipping unreadable estimate row"
                    ),
                }
            }
        }
        Ok(restored)
    }

    pub fn path_for(&self, asset: &AssetId) -> PathBuf {
        self.dir.join(format!("{}.csv", asset.file_stem()))
    }

    fn create_writer(path: &Path) -> Result<csv::Writer<fs::File>> {
        let file_has_data =
            path.exists() && fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        Ok(WriterBuilder::new()
            .has_headers(!file_has_data)
            .from_writer(file))
    }

    async fn append(&self, estimate: &Estimate) -> Result<()> {
        let mut writers = self.writers.lock().await;
        if !writers.contains_key(&estimate.asset) {
            let writer = Self::create_writer(&self.path_for(&estimate.asset))?;
            writers.insert(estimate.asset.clone(), writer);
        }
        let Some(writer) = writers.get_mut(&estimate.asset) else {
            return Ok(());
        };

        let result = writer
            .serialize(EstimateRecord::from(estimate))
            .context("Failed to write estimate record")
            .and_then(|_| writer.flush().context("Failed to flush estimate writer"));
        if result.is_err() {
            // Reopen on the next save rather than reuse a broken handle
            writers.remove(&estimate.asset);
        }
        result
    }
}

#[async_trait]
impl PriceStore for CsvPriceStore {
    async fn save_price(&self, estimate: &Estimate) -> Result<()> {
        self.memory.save_price(estimate).await?;
        self.append(estimate).await
    }

    async fn get_price(&self, asset: &AssetId) -> Result<Option<Estimate>> {
        self.memory.get_price(asset).await
    }

    async fn get_price_history(
        &self,
        asset: &AssetId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Estimate>> {
        self.memory.get_price_history(asset, start, end).await
    }

    async fn delete_price(&self, asset: &AssetId, timestamp: DateTime<Utc>) -> Result<usize> {
        // The CSV file is an audit log; retention only applies to the read side
        self.memory.delete_price(asset, timestamp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::BTreeSet;

    fn temp_data_dir(test_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "pricefeed_csv_{}_{}",
            test_name,
            uuid::Uuid::new_v4()
        ))
    }

    fn estimate(at: DateTime<Utc>) -> Estimate {
        Estimate {
            asset: "NEO/USD".into(),
            price: dec!(12.345),
            confidence: 0.8,
            source_count: 3,
            std_dev: dec!(0.01),
            outlier_sources: BTreeSet::from(["bad".to_string(), "worse".to_string()]),
            observed_at: at,
        }
    }

    #[tokio::test]
    async fn test_appends_rows_with_single_header() {
        let data_dir = temp_data_dir("append");
        let t0 = Utc::now();
        {
            let store = CsvPriceStore::new(&data_dir).unwrap();
            store.save_price(&estimate(t0)).await.unwrap();
        }
        // A fresh store appends to the existing file without a second header
        let store = CsvPriceStore::new(&data_dir).unwrap();
        store
            .save_price(&estimate(t0 + chrono::Duration::seconds(1)))
            .await
            .unwrap();

        let path = store.path_for(&"NEO/USD".into());
        assert!(path.ends_with("NEO_USD.csv"));
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .from_path(&path)
            .unwrap();
        let rows: Vec<EstimateRecord> = reader.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].price, "12.345");
        assert_eq!(rows[0].outlier_sources, "bad;worse");
        assert_eq!(rows[0].timestamp, t0);

        let _ = fs::remove_dir_all(&data_dir);
    }

    #[tokio::test]
    async fn test_reads_come_from_memory() {
        let data_dir = temp_data_dir("reads");
        let store = CsvPriceStore::new(&data_dir).unwrap();
        let e = estimate(Utc::now());
        store.save_price(&e).await.unwrap();
        assert_eq!(store.get_price(&e.asset).await.unwrap(), Some(e.clone()));
        assert_eq!(store.delete_price(&e.asset, e.observed_at).await.unwrap(), 1);
        assert_eq!(store.get_price(&e.asset).await.unwrap(), None);

        let _ = fs::remove_dir_all(&data_dir);
    }

    #[tokio::test]
    async fn test_sub_millisecond_estimates_keep_distinct_rows() {
        let data_dir = temp_data_dir("precision");
        let store = CsvPriceStore::new(&data_dir).unwrap();
        let t0 = Utc::now();
        let first = estimate(t0);
        let second = estimate(t0 + chrono::Duration::microseconds(1));
        store.save_price(&first).await.unwrap();
        store.save_price(&second).await.unwrap();

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .from_path(store.path_for(&first.asset))
            .unwrap();
        let rows: Vec<EstimateRecord> = reader.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_ne!(rows[0].timestamp, rows[1].timestamp);
        assert_eq!(rows[1].timestamp, second.observed_at);

        let _ = fs::remove_dir_all(&data_dir);
    }

    #[tokio::test]
    async fn test_reopen_restores_current_and_history() {
        let data_dir = temp_data_dir("restore");
        let t0 = Utc::now();
        let older = estimate(t0);
        let newer = Estimate {
            price: dec!(13.5),
            outlier_sources: BTreeSet::new(),
            ..estimate(t0 + chrono::Duration::seconds(5))
        };
        {
            let store = CsvPriceStore::new(&data_dir).unwrap();
            store.save_price(&older).await.unwrap();
            store.save_price(&newer).await.unwrap();
        }
        // A torn trailing row is skipped, not fatal
        let path = data_dir.join("estimates").join("NEO_USD.csv");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut file, b"not-a-time,NEO/USD\n").unwrap();

        let store = CsvPriceStore::new(&data_dir).unwrap();
        let asset: AssetId = "NEO/USD".into();
        assert_eq!(store.get_price(&asset).await.unwrap(), Some(newer.clone()));
        let history = store
            .get_price_history(&asset, t0 - chrono::Duration::seconds(1), t0 + chrono::Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(history, vec![older, newer]);

        let _ = fs::remove_dir_all(&data_dir);
    }
}
