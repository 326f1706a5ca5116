//! Core types used throughout PriceFeed
//!
//! Defines the data flowing through a cycle: quotes from sources,
//! reconciled estimates, and the asset key they are indexed by.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Tracked asset identifier (e.g. a trading pair symbol such as "NEO/USD")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-system safe form, used for per-asset CSV names ("NEO/USD" -> "NEO_USD")
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for AssetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A single source's reported price for an asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    /// Name of the source that produced this quote
    pub source: String,
    pub asset: AssetId,
    pub price: Decimal,
    /// When the source observed the price (source clock)
    pub observed_at: DateTime<Utc>,
    /// Round-trip time of the request that returned this quote
    #[serde(with = "duration_ms")]
    pub latency: Duration,
}

impl Quote {
    /// Age of the quote relative to `now`; negative ages clamp to zero
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.observed_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Reconciled price published once per successful cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub asset: AssetId,
    /// Filtered price
    pub price: Decimal,
    /// Trust score in [0, 1]
    pub confidence: f64,
    /// Quotes that survived outlier removal
    pub source_count: usize,
    /// Sample standard deviation of the surviving quotes
    pub std_dev: Decimal,
    /// Sources whose quotes were discarded as outliers this cycle
    pub outlier_sources: BTreeSet<String>,
    pub observed_at: DateTime<Utc>,
}

impl fmt::Display for Estimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {} (conf={:.3}, sources={}, sd={})",
            self.asset, self.price, self.confidence, self.source_count, self.std_dev
        )
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
