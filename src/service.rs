//! PriceFeed - the read and control surface over a running pipeline

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::alerts::AlertEvent;
use crate::driver::{CycleDriver, Pipeline, PipelineParts};
use crate::error::{FeedError, PolicyError};
use crate::hub::{Subscription, SubscriptionId};
use crate::metrics::MetricsSnapshot;
use crate::policy::UpdatePolicy;
use crate::types::{AssetId, Estimate};

pub struct PriceFeed {
    driver: CycleDriver,
}

impl PriceFeed {
    pub fn new(parts: PipelineParts) -> Self {
        Self {
            driver: CycleDriver::new(Arc::new(Pipeline::new(parts))),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        self.driver.pipeline()
    }

    /// Latest estimate for `asset`. Raises StalePrice first when the asset
    /// has not updated within `max_data_age`.
    pub async fn get_price(&self, asset: &AssetId) -> Result<Estimate, FeedError> {
        let pipeline = self.pipeline();
        let estimate = pipeline.store().get_price(asset).await?;

        let last_updated = pipeline
            .last_updated(asset)
            .or_else(|| estimate.as_ref().map(|e| e.observed_at));
        if let Some(last_updated) = last_updated {
            pipeline.check_stale(asset, last_updated, Utc::now());
        }

        estimate.ok_or_else(|| FeedError::NotFound(asset.clone()))
    }

    /// Stored estimates with `start < observed_at < end`, oldest first
    pub async fn get_price_history(
        &self,
        asset: &AssetId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Estimate>, FeedError> {
        Ok(self
            .pipeline()
            .store()
            .get_price_history(asset, start, end)
            .await?)
    }

    pub fn subscribe(&self, asset: &AssetId) -> Subscription {
        self.pipeline().hub().subscribe(asset)
    }

    pub fn unsubscribe(&self, asset: &AssetId, id: SubscriptionId) -> bool {
        self.pipeline().hub().unsubscribe(asset, id)
    }

    pub fn alerts(&self) -> Vec<AlertEvent> {
        self.pipeline().alerts().alerts()
    }

    pub fn clear_alerts(&self) {
        self.pipeline().alerts().clear_alerts()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.pipeline().metrics().snapshot()
    }

    pub fn policy(&self) -> Arc<UpdatePolicy> {
        self.pipeline().policy().current()
    }

    /// Swap the live policy; an invalid candidate leaves the current one in force.
    pub fn update_policy(&self, policy: UpdatePolicy) -> Result<(), PolicyError> {
        let result = self.pipeline().policy().update(policy);
        match &result {
            Ok(()) => tracing::info!("update policy replaced"),
            Err(e) => tracing::warn!(error = %e, "update policy rejected"),
        }
        result
    }

    pub fn start(&self) -> bool {
        self.driver.start()
    }

    pub async fn stop(&self) {
        self.driver.stop().await
    }

    pub fn is_running(&self) -> bool {
        self.driver.is_running()
    }
}
