//! Quote source contract and the built-in simulated source

mod simulated;

pub use simulated::{SimulatedSource, SimulatedSourceConfig};

use crate::types::{AssetId, Quote};
use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;

/// A semi-trusted external price source.
///
/// Implementations should give up by `deadline`; the fan-out enforces the
/// deadline regardless, so a late answer is simply discarded.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// Get the source name
    fn name(&self) -> &str;

    /// Fetch the current price for one asset
    async fn get_price(&self, asset: &AssetId, deadline: Instant) -> Result<Quote>;
}
