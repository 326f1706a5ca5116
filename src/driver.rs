//! Cycle Driver - periodic Fetch -> Validate -> Resolve -> Estimate -> Store
//! -> Publish -> Notify for every tracked asset
//!
//! Each asset owns one slot (estimator state plus last published price)
//! behind its own async mutex, so two cycles for the same asset never
//! overlap while different assets run fully independently.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use crate::alerts::AlertManager;
use crate::error::CycleError;
use crate::hub::NotificationHub;
use crate::metrics::MetricsCollector;
use crate::oracle::estimator::StateEstimator;
use crate::oracle::fanout::FetchFanout;
use crate::oracle::resolver::resolve;
use crate::oracle::sources::QuoteSource;
use crate::oracle::validator::validate_quotes;
use crate::persistence::PriceStore;
use crate::policy::{PolicyHandle, UpdatePolicy};
use crate::publisher::ChainPublisher;
use crate::shutdown::{self, ShutdownSignal, ShutdownTrigger};
use crate::types::{AssetId, Estimate};

/// Decimal places kept when converting filter output to prices
const PRICE_SCALE: u32 = 8;

/// Collaborators and settings a pipeline is assembled from
pub struct PipelineParts {
    pub assets: Vec<AssetId>,
    pub sources: Vec<Arc<dyn QuoteSource>>,
    pub store: Arc<dyn PriceStore>,
    pub publisher: Arc<dyn ChainPublisher>,
    pub policy: PolicyHandle,
    pub source_timeout: Duration,
    /// History older than this is pruned each tick; `None` keeps everything
    pub history_retention: Option<Duration>,
    pub hub_capacity: usize,
}

#[derive(Debug, Default)]
struct AssetSlot {
    estimator: StateEstimator,
    last_published: Option<Decimal>,
}

/// Shared state of one running feed
pub struct Pipeline {
    assets: Vec<AssetId>,
    policy: PolicyHandle,
    fanout: FetchFanout,
    store: Arc<dyn PriceStore>,
    publisher: Arc<dyn ChainPublisher>,
    hub: Arc<NotificationHub>,
    alerts: Arc<AlertManager>,
    metrics: Arc<MetricsCollector>,
    slots: RwLock<HashMap<AssetId, Arc<Mutex<AssetSlot>>>>,
    history_retention: Option<Duration>,
    /// Held by the retention pass in flight, if any
    pruning: Arc<Mutex<()>>,
}

impl Pipeline {
    pub fn new(parts: PipelineParts) -> Self {
        let alerts = Arc::new(AlertManager::new());
        let metrics = Arc::new(MetricsCollector::new());
        let fanout = FetchFanout::new(
            parts.sources,
            parts.source_timeout,
            alerts.clone(),
            metrics.clone(),
        );
        let slots = parts
            .assets
            .iter()
            .map(|a| (a.clone(), Arc::new(Mutex::new(AssetSlot::default()))))
            .collect();
        Self {
            assets: parts.assets,
            policy: parts.policy,
            fanout,
            store: parts.store,
            publisher: parts.publisher,
            hub: Arc::new(NotificationHub::new(parts.hub_capacity)),
            alerts,
            metrics,
            slots: RwLock::new(slots),
            history_retention: parts.history_retention,
            pruning: Arc::new(Mutex::new(())),
        }
    }

    pub fn assets(&self) -> &[AssetId] {
        &self.assets
    }

    pub fn policy(&self) -> &PolicyHandle {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn PriceStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    fn slot(&self, asset: &AssetId) -> Arc<Mutex<AssetSlot>> {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(asset)
        {
            return slot.clone();
        }
        self.slots
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .entry(asset.clone())
            .or_default()
            .clone()
    }

    /// Estimator timestamp for `asset`, if tracked and not mid-cycle
    pub fn last_updated(&self, asset: &AssetId) -> Option<DateTime<Utc>> {
        let slot = self.slot(asset);
        let guard = slot.try_lock().ok()?;
        guard.estimator.last_updated()
    }

    /// Raise StalePrice when `last_updated` is older than the policy allows.
    pub fn check_stale(&self, asset: &AssetId, last_updated: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let max_age = self.policy.current().max_data_age;
        let age = (now - last_updated).to_std().unwrap_or(Duration::ZERO);
        if age > max_age {
            self.alerts.alert_stale_price(asset, last_updated)
        } else {
            false
        }
    }

    /// Run one full cycle for `asset`, waiting for any cycle already in progress.
    pub async fn run_cycle(
        &self,
        asset: &AssetId,
        shutdown: &ShutdownSignal,
    ) -> Result<Estimate, CycleError> {
        let guard = self.slot(asset).lock_owned().await;
        self.run_locked(asset, guard, shutdown).await
    }

    async fn run_locked(
        &self,
        asset: &AssetId,
        mut slot: OwnedMutexGuard<AssetSlot>,
        shutdown: &ShutdownSignal,
    ) -> Result<Estimate, CycleError> {
        let span = tracing::info_span!("cycle", asset = %asset);
        async {
            let started = Instant::now();
            let policy = self.policy.current();
            let result = self.cycle(asset, &mut slot, &policy, shutdown).await;

            match &result {
                Ok(estimate) => {
                    self.metrics.record_update(asset, started.elapsed());
                    tracing::info!(estimate = %estimate, "cycle complete");
                }
                Err(e) => {
                    self.metrics.record_failed_update(asset, e.kind());
                    tracing::warn!(error = %e, "cycle produced no estimate");
                }
            }

            if let Some(last_updated) = slot.estimator.last_updated() {
                self.check_stale(asset, last_updated, Utc::now());
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn cycle(
        &self,
        asset: &AssetId,
        slot: &mut AssetSlot,
        policy: &UpdatePolicy,
        shutdown: &ShutdownSignal,
    ) -> Result<Estimate, CycleError> {
        let outcome = self.fanout.fetch(asset, shutdown).await;

        let now = Utc::now();
        let quotes = validate_quotes(asset, outcome.quotes, policy, now)?;
        let consensus = resolve(&quotes, policy, self.fanout.source_count(), now)?;
        let filtered = slot.estimator.observe(
            consensus.measurement,
            consensus.confidence,
            consensus.observed_at,
            policy,
        )?;

        // Published price stays within the outlier band around this cycle's quotes
        let (low, high) = consensus.price_band(policy.outlier_threshold_std_devs);
        let price = slot
            .estimator
            .constrain(low, high)
            .unwrap_or(filtered.price);
        if price != filtered.price {
            tracing::debug!(filtered = filtered.price, published = price, "filter output clamped to consensus band");
        }

        let estimate = Estimate {
            asset: asset.clone(),
            price: to_decimal(price, "price")?,
            confidence: consensus.confidence,
            source_count: consensus.survivors.len(),
            std_dev: to_decimal(consensus.std_dev, "std_dev")?,
            outlier_sources: consensus.outlier_sources,
            observed_at: filtered.observed_at,
        };

        if let Some(previous) = slot.last_published {
            if exceeds_deviation(previous, estimate.price, policy.deviation_alert_threshold) {
                self.alerts
                    .alert_price_deviation(asset, previous, estimate.price);
            }
        }
        slot.last_published = Some(estimate.price);

        if let Err(e) = self.store.save_price(&estimate).await {
            let error = CycleError::Persistence(format!("{:#}", e));
            tracing::error!(error = %error, "estimate not persisted, delivering anyway");
            self.metrics.record_persistence_failure();
            self.alerts
                .alert_persistence_failure(asset, &error.to_string());
        }

        match self.publisher.publish(&estimate).await {
            Ok(reference) => tracing::debug!(reference = %reference, "estimate published"),
            Err(e) => {
                let error = CycleError::Publish(format!("{:#}", e));
                tracing::warn!(error = %error, "chain publish failed");
                self.metrics.record_publish_failure();
                self.alerts.alert_publish_failure(asset, &error.to_string());
            }
        }

        let delivery = self.hub.publish(&estimate);
        self.metrics
            .record_dropped_notifications(delivery.dropped as u64);

        Ok(estimate)
    }

    /// Run one cycle for every tracked asset concurrently.
    pub async fn tick(
        &self,
        shutdown: &ShutdownSignal,
    ) -> HashMap<AssetId, Result<Estimate, CycleError>> {
        let cycles = self.assets.iter().map(|asset| async move {
            (asset.clone(), self.run_cycle(asset, shutdown).await)
        });
        join_all(cycles).await.into_iter().collect()
    }

    /// Delete history older than the retention window, always keeping the
    /// current estimate. Returns the number of entries removed.
    pub async fn prune_history(&self, now: DateTime<Utc>) -> usize {
        let Some(retention) = self.history_retention else {
            return 0;
        };
        let Ok(retention) = ChronoDuration::from_std(retention) else {
            return 0;
        };
        let cutoff = now - retention;
        let mut removed = 0;

        for asset in &self.assets {
            let current = match self.store.get_price(asset).await {
                Ok(current) => current.map(|e| e.observed_at),
                Err(e) => {
                    tracing::warn!(asset = %asset, error = %e, "retention scan failed");
                    continue;
                }
            };
            let expired = match self
                .store
                .get_price_history(asset, DateTime::<Utc>::MIN_UTC, cutoff)
                .await
            {
                Ok(expired) => expired,
                Err(e) => {
                    tracing::warn!(asset = %asset, error = %e, "retention scan failed");
                    continue;
                }
            };
            for entry in expired {
                if Some(entry.observed_at) == current {
                    continue;
                }
                match self.store.delete_price(asset, entry.observed_at).await {
                    Ok(n) => removed += n,
                    Err(e) => {
                        tracing::warn!(asset = %asset, error = %e, "retention delete failed")
                    }
                }
            }
        }
        removed
    }

    async fn run_loop(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let mut period = self.policy.current().update_interval;
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight = JoinSet::new();
        let mut housekeeping = JoinSet::new();

        tracing::info!(assets = self.assets.len(), period_ms = period.as_millis() as u64, "cycle driver started");

        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = interval.tick() => {
                    let current = self.policy.current().update_interval;
                    if current != period {
                        tracing::info!(period_ms = current.as_millis() as u64, "update interval changed");
                        period = current;
                        interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    }

                    self.hub.reap_closed();

                    for asset in &self.assets {
                        let Ok(guard) = self.slot(asset).try_lock_owned() else {
                            tracing::debug!(asset = %asset, "previous cycle still running, skipping tick");
                            continue;
                        };
                        let pipeline = Arc::clone(&self);
                        let asset = asset.clone();
                        let signal = shutdown.clone();
                        in_flight.spawn(async move {
                            let _ = pipeline.run_locked(&asset, guard, &signal).await;
                        });
                    }

                    if self.history_retention.is_some() {
                        match Arc::clone(&self.pruning).try_lock_owned() {
                            Ok(guard) => {
                                let pipeline = Arc::clone(&self);
                                housekeeping.spawn(async move {
                                    let _guard = guard;
                                    let pruned = pipeline.prune_history(Utc::now()).await;
                                    if pruned > 0 {
                                        tracing::debug!(pruned, "history retention applied");
                                    }
                                });
                            }
                            Err(_) => tracing::debug!("previous retention pass still running"),
                        }
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join(joined);
                }
                Some(joined) = housekeeping.join_next(), if !housekeeping.is_empty() => {
                    log_join(joined);
                }
            }
        }

        // Retention is redone on the next start; cycles already started finish
        housekeeping.abort_all();
        while housekeeping.join_next().await.is_some() {}
        while let Some(joined) = in_flight.join_next().await {
            log_join(joined);
        }
        self.hub.close_all();
        tracing::info!("cycle driver stopped");
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!("cycle task panicked");
        } else {
            tracing::warn!(error = %e, "cycle task aborted");
        }
    }
}

fn to_decimal(value: f64, what: &str) -> Result<Decimal, CycleError> {
    Decimal::from_f64(value)
        .map(|d| d.round_dp(PRICE_SCALE))
        .ok_or_else(|| CycleError::InvalidMeasurement(format!("{} {} not representable", what, value)))
}

/// Relative move from `previous` to `current` above `threshold`
fn exceeds_deviation(previous: Decimal, current: Decimal, threshold: f64) -> bool {
    if previous.is_zero() {
        return false;
    }
    ((current - previous).abs() / previous.abs())
        .to_f64()
        .map(|change| change > threshold)
        .unwrap_or(false)
}

struct Running {
    trigger: ShutdownTrigger,
    handle: JoinHandle<()>,
}

/// Owns the periodic loop over a shared `Pipeline`.
pub struct CycleDriver {
    pipeline: Arc<Pipeline>,
    running: StdMutex<Option<Running>>,
}

impl CycleDriver {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            running: StdMutex::new(None),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Spawn the loop on the current runtime. Returns false if already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if running.is_some() {
            return false;
        }
        let (trigger, signal) = shutdown::channel();
        let handle = tokio::spawn(Arc::clone(&self.pipeline).run_loop(signal));
        *running = Some(Running { trigger, handle });
        true
    }

    /// Stop scheduling, wait for started cycles, close every subscription.
    /// Calling it again, or before `start`, only re-closes the (empty) hub.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(Running { trigger, handle }) = running {
            trigger.trigger();
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "cycle driver task failed");
            }
        }
        self.pipeline.hub.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertKind;
    use crate::persistence::{MemoryPriceStore, MockPriceStore};
    use crate::publisher::MockChainPublisher;
    use anyhow::{anyhow, bail, Result};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Source returning a scripted price per asset
    struct FixedSource {
        name: String,
        prices: StdMutex<HashMap<AssetId, Decimal>>,
        calls: AtomicU64,
    }

    impl FixedSource {
        fn new(name: &str, prices: &[(&str, Decimal)]) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                prices: StdMutex::new(prices.iter().map(|(a, p)| ((*a).into(), *p)).collect()),
                calls: AtomicU64::new(0),
            })
        }

        fn set(&self, asset: &str, price: Decimal) {
            self.prices.lock().unwrap().insert(asset.into(), price);
        }
    }

    #[async_trait]
    impl QuoteSource for FixedSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn get_price(&self, asset: &AssetId, _deadline: tokio::time::Instant) -> Result<crate::types::Quote> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let Some(price) = self.prices.lock().unwrap().get(asset).copied() else {
                bail!("unknown asset {}", asset);
            };
            Ok(crate::types::Quote {
                source: self.name.clone(),
                asset: asset.clone(),
                price,
                observed_at: Utc::now(),
                latency: Duration::from_millis(1),
            })
        }
    }

    fn ok_publisher() -> Arc<dyn ChainPublisher> {
        let mut publisher = MockChainPublisher::new();
        publisher
            .expect_publish()
            .returning(|_| Ok("0xabc".to_string()));
        Arc::new(publisher)
    }

    fn pipeline(
        sources: Vec<Arc<FixedSource>>,
        store: Arc<dyn PriceStore>,
        publisher: Arc<dyn ChainPublisher>,
        assets: &[&str],
    ) -> Arc<Pipeline> {
        let policy = UpdatePolicy {
            min_source_count: 2,
            ..UpdatePolicy::default()
        };
        Arc::new(Pipeline::new(PipelineParts {
            assets: assets.iter().map(|a| (*a).into()).collect(),
            sources: sources
                .into_iter()
                .map(|s| s as Arc<dyn QuoteSource>)
                .collect(),
            store,
            publisher,
            policy: PolicyHandle::new(policy).unwrap(),
            source_timeout: Duration::from_millis(200),
            history_retention: None,
            hub_capacity: 8,
        }))
    }

    fn three_sources(asset: &str, price: Decimal) -> Vec<Arc<FixedSource>> {
        ["a", "b", "c"]
            .iter()
            .map(|n| FixedSource::new(n, &[(asset, price)]))
            .collect()
    }

    #[tokio::test]
    async fn test_cycle_stores_and_notifies() {
        let store = Arc::new(MemoryPriceStore::new());
        let p = pipeline(three_sources("BTC", dec!(100)), store.clone(), ok_publisher(), &["BTC"]);
        let asset: AssetId = "BTC".into();
        let mut sub = p.hub().subscribe(&asset);

        let estimate = p.run_cycle(&asset, &ShutdownSignal::never()).await.unwrap();
        assert_eq!(estimate.price, dec!(100));
        assert_eq!(estimate.source_count, 3);
        assert_eq!(store.get_price(&asset).await.unwrap(), Some(estimate.clone()));
        assert_eq!(sub.try_recv().unwrap(), estimate);
        assert_eq!(p.metrics().snapshot().total_updates, 1);
    }

    #[tokio::test]
    async fn test_failed_validation_leaves_store_untouched() {
        let store = Arc::new(MemoryPriceStore::new());
        let sources = vec![FixedSource::new("a", &[("BTC", dec!(100))])];
        let p = pipeline(sources, store.clone(), ok_publisher(), &["BTC"]);
        let asset: AssetId = "BTC".into();

        let err = p.run_cycle(&asset, &ShutdownSignal::never()).await.unwrap_err();
        assert_eq!(err, CycleError::InsufficientSources { required: 2, available: 1 });
        assert_eq!(store.get_price(&asset).await.unwrap(), None);
        let metrics = p.metrics().snapshot();
        assert_eq!(metrics.failed_updates, 1);
        assert_eq!(metrics.failures_by_reason.get("insufficient_sources"), Some(&1));
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_store_and_delivery() {
        let store = Arc::new(MemoryPriceStore::new());
        let mut publisher = MockChainPublisher::new();
        publisher
            .expect_publish()
            .times(1)
            .returning(|_| Err(anyhow!("rpc unavailable")));
        let p = pipeline(three_sources("BTC", dec!(100)), store.clone(), Arc::new(publisher), &["BTC"]);
        let asset: AssetId = "BTC".into();
        let mut sub = p.hub().subscribe(&asset);

        let estimate = p.run_cycle(&asset, &ShutdownSignal::never()).await.unwrap();
        assert_eq!(store.get_price(&asset).await.unwrap(), Some(estimate));
        assert!(sub.try_recv().is_ok());
        assert_eq!(p.alerts().alerts_of(AlertKind::PublishFailure).len(), 1);
        assert_eq!(p.metrics().snapshot().publish_failures, 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_still_delivers() {
        let mut store = MockPriceStore::new();
        store
            .expect_save_price()
            .returning(|_| Err(anyhow!("disk full")));
        let p = pipeline(three_sources("BTC", dec!(100)), Arc::new(store), ok_publisher(), &["BTC"]);
        let asset: AssetId = "BTC".into();
        let mut sub = p.hub().subscribe(&asset);

        let estimate = p.run_cycle(&asset, &ShutdownSignal::never()).await.unwrap();
        assert_eq!(sub.try_recv().unwrap(), estimate);
        assert_eq!(p.alerts().alerts_of(AlertKind::PersistenceFailure).len(), 1);
        assert_eq!(p.metrics().snapshot().persistence_failures, 1);
    }

    #[tokio::test]
    async fn test_large_move_raises_one_deviation_alert() {
        let sources = three_sources("BTC", dec!(100));
        let p = pipeline(sources.clone(), Arc::new(MemoryPriceStore::new()), ok_publisher(), &["BTC"]);
        let asset: AssetId = "BTC".into();
        let never = ShutdownSignal::never();

        p.run_cycle(&asset, &never).await.unwrap();
        p.run_cycle(&asset, &never).await.unwrap();
        assert!(p.alerts().alerts_of(AlertKind::PriceDeviation).is_empty());

        for s in &sources {
            s.set("BTC", dec!(200));
        }
        p.run_cycle(&asset, &never).await.unwrap();
        assert_eq!(p.alerts().alerts_of(AlertKind::PriceDeviation).len(), 1);
    }

    #[tokio::test]
    async fn test_failing_asset_does_not_affect_others() {
        // Every source knows BTC; only one knows ETH
        let sources = vec![
            FixedSource::new("a", &[("BTC", dec!(100)), ("ETH", dec!(10))]),
            FixedSource::new("b", &[("BTC", dec!(100))]),
            FixedSource::new("c", &[("BTC", dec!(100))]),
        ];
        let p = pipeline(sources, Arc::new(MemoryPriceStore::new()), ok_publisher(), &["BTC", "ETH"]);

        let results = p.tick(&ShutdownSignal::never()).await;
        assert!(results[&AssetId::from("BTC")].is_ok());
        assert!(matches!(
            results[&AssetId::from("ETH")],
            Err(CycleError::InsufficientSources { .. })
        ));
        assert_eq!(p.alerts().alerts_of(AlertKind::DataSourceFailure).len(), 2);
    }

    #[tokio::test]
    async fn test_prune_keeps_current_estimate() {
        let store = Arc::new(MemoryPriceStore::new());
        let asset: AssetId = "BTC".into();
        let now = Utc::now();
        for age in [7200, 3600, 10] {
            store
                .save_price(&Estimate {
                    asset: asset.clone(),
                    price: dec!(100),
                    confidence: 1.0,
                    source_count: 3,
                    std_dev: Decimal::ZERO,
                    outlier_sources: Default::default(),
                    observed_at: now - ChronoDuration::seconds(age),
                })
                .await
                .unwrap();
        }
        let mut p = Pipeline::new(PipelineParts {
            assets: vec![asset.clone()],
            sources: vec![],
            store: store.clone(),
            publisher: ok_publisher(),
            policy: PolicyHandle::default(),
            source_timeout: Duration::from_millis(100),
            history_retention: Some(Duration::from_secs(60)),
            hub_capacity: 1,
        });
        assert_eq!(p.prune_history(now).await, 2);
        assert_eq!(store.history_len(&asset), 1);

        // Everything expired: the current estimate survives
        p.history_retention = Some(Duration::from_secs(1));
        assert_eq!(p.prune_history(now).await, 0);
        assert!(store.get_price(&asset).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_idempotent() {
        let sources = three_sources("BTC", dec!(100));
        let p = pipeline(sources.clone(), Arc::new(MemoryPriceStore::new()), ok_publisher(), &["BTC"]);
        let driver = CycleDriver::new(p.clone());
        let mut sub = p.hub().subscribe(&"BTC".into());

        assert!(driver.start());
        assert!(!driver.start());
        assert!(driver.is_running());

        // First tick fires immediately
        let first = sub.recv().await.unwrap();
        assert_eq!(first.price, dec!(100));

        driver.stop().await;
        let alerts_after_first_stop = p.alerts().alerts().len();
        driver.stop().await;

        assert!(!driver.is_running());
        assert_eq!(p.alerts().alerts().len(), alerts_after_first_stop);
        // Subscriptions are closed once the backlog drains
        while sub.recv().await.is_some() {}

        let calls = sources[0].calls.load(Ordering::Relaxed);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(sources[0].calls.load(Ordering::Relaxed), calls);
    }

    /// Store whose history scan never returns
    #[derive(Default)]
    struct StuckHistoryStore {
        inner: MemoryPriceStore,
        scans: AtomicU64,
    }

    #[async_trait]
    impl PriceStore for StuckHistoryStore {
        async fn save_price(&self, estimate: &Estimate) -> Result<()> {
            self.inner.save_price(estimate).await
        }

        async fn get_price(&self, asset: &AssetId) -> Result<Option<Estimate>> {
            self.inner.get_price(asset).await
        }

        async fn get_price_history(
            &self,
            _asset: &AssetId,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<Vec<Estimate>> {
            self.scans.fetch_add(1, Ordering::Relaxed);
            std::future::pending::<()>().await;
            unreachable!()
        }

        async fn delete_price(&self, asset: &AssetId, timestamp: DateTime<Utc>) -> Result<usize> {
            self.inner.delete_price(asset, timestamp).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_retention_pass_does_not_block_loop_or_stop() {
        let store = Arc::new(StuckHistoryStore::default());
        let p = Arc::new(Pipeline::new(PipelineParts {
            assets: vec!["BTC".into()],
            sources: three_sources("BTC", dec!(100))
                .into_iter()
                .map(|s| s as Arc<dyn QuoteSource>)
                .collect(),
            store: store.clone(),
            publisher: ok_publisher(),
            policy: PolicyHandle::new(UpdatePolicy {
                min_source_count: 2,
                ..UpdatePolicy::default()
            })
            .unwrap(),
            source_timeout: Duration::from_millis(200),
            history_retention: Some(Duration::from_secs(60)),
            hub_capacity: 8,
        }));
        let driver = CycleDriver::new(p.clone());
        let mut sub = p.hub().subscribe(&"BTC".into());

        driver.start();
        sub.recv().await.unwrap();
        // The next tick still fires while the first retention pass hangs
        let second = tokio::time::timeout(Duration::from_secs(30), sub.recv()).await;
        assert!(matches!(second, Ok(Some(_))));
        // Overlapping retention passes are skipped
        assert_eq!(store.scans.load(Ordering::Relaxed), 1);

        let stopped = tokio::time::timeout(Duration::from_secs(1), driver.stop()).await;
        assert!(stopped.is_ok());
        assert!(!driver.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_swap_applies_on_next_tick() {
        let sources = three_sources("BTC", dec!(100));
        let p = pipeline(sources.clone(), Arc::new(MemoryPriceStore::new()), ok_publisher(), &["BTC"]);
        p.policy()
            .update(UpdatePolicy {
                min_source_count: 2,
                multi_state_enabled: true,
                ..UpdatePolicy::default()
            })
            .unwrap();
        let driver = CycleDriver::new(p.clone());
        let mut sub = p.hub().subscribe(&"BTC".into());
        let calls = || sources[0].calls.load(Ordering::Relaxed);

        driver.start();
        assert_eq!(sub.recv().await.unwrap().price, dec!(100));
        assert_eq!(calls(), 1);

        p.policy()
            .update(UpdatePolicy {
                update_interval: Duration::from_secs(20),
                min_source_count: 4,
                multi_state_enabled: true,
                ..UpdatePolicy::default()
            })
            .unwrap();

        // The tick already armed at 5s runs under the new source requirement
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(calls(), 2);
        let metrics = p.metrics().snapshot();
        assert_eq!(metrics.failed_updates, 1);
        assert_eq!(metrics.failures_by_reason.get("insufficient_sources"), Some(&1));

        // and re-arms the loop 20s out: nothing at 10s, 15s or 20s
        tokio::time::sleep(Duration::from_secs(19)).await;
        assert_eq!(calls(), 2);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls(), 3);

        driver.stop().await;
    }

    #[test]
    fn test_deviation_is_relative() {
        assert!(exceeds_deviation(dec!(100), dec!(111), 0.1));
        assert!(!exceeds_deviation(dec!(100), dec!(109), 0.1));
        assert!(exceeds_deviation(dec!(100), dec!(89), 0.1));
        assert!(!exceeds_deviation(Decimal::ZERO, dec!(1), 0.1));
    }
}
