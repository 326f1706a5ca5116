//! Chain publication seam
//!
//! The engine hands every finished estimate to a `ChainPublisher` once per
//! cycle. Transaction construction and signing live behind this trait.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::types::Estimate;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainPublisher: Send + Sync {
    /// Submit an estimate, returning an opaque reference (e.g. a tx hash).
    async fn publish(&self, estimate: &Estimate) -> Result<String>;
}

/// Publisher that only logs; its reference is the SHA-256 of the serialized estimate.
#[derive(Debug, Default, Clone)]
pub struct DryRunPublisher;

impl DryRunPublisher {
    pub fn new() -> Self {
        Self
    }

    pub fn reference_for(estimate: &Estimate) -> Result<String> {
        let body = serde_json::to_vec(estimate).context("Failed to serialize estimate")?;
        Ok(hex::encode(Sha256::digest(&body)))
    }
}

#[async_trait]
impl ChainPublisher for DryRunPublisher {
    async fn publish(&self, estimate: &Estimate) -> Result<String> {
        let reference = Self::reference_for(estimate)?;
        tracing::info!(
            asset = %estimate.asset,
            price = %estimate.price,
            confidence = estimate.confidence,
            reference = %reference,
            "dry-run publish"
        );
        Ok(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::collections::BTreeSet;

    #[tokio::test]
    async fn test_reference_is_stable_digest() {
        let estimate = Estimate {
            asset: "BTC".into(),
            price: dec!(100.5),
            confidence: 0.9,
            source_count: 3,
            std_dev: dec!(0.5),
            outlier_sources: BTreeSet::new(),
            observed_at: Utc::now(),
        };
        let publisher = DryRunPublisher::new();
        let a = publisher.publish(&estimate).await.unwrap();
        let b = publisher.publish(&estimate).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let mut moved = estimate.clone();
        moved.price = dec!(100.6);
        assert_ne!(a, publisher.publish(&moved).await.unwrap());
    }
}
