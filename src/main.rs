//! PriceFeed daemon
//!
//! Runs the cycle driver over simulated sources, persisting to CSV and
//! publishing through the dry-run publisher. SIGHUP reloads the update policy.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use pricefeed::config::AppConfig;
use pricefeed::logging::init_tracing;
use pricefeed::oracle::sources::{QuoteSource, SimulatedSource};
use pricefeed::persistence::{CsvPriceStore, MemoryPriceStore, PriceStore};
use pricefeed::policy::PolicyHandle;
use pricefeed::publisher::{ChainPublisher, DryRunPublisher};
use pricefeed::{PipelineParts, PriceFeed};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_tracing(config.feed.json_logs);
    info!(config = %config, "🚀 PriceFeed starting");

    let feed = build_feed(&config)?;
    feed.start();

    #[cfg(unix)]
    tokio::spawn(reload_on_sighup(Arc::clone(&feed)));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("shutdown requested, draining in-flight cycles");
    feed.stop().await;

    let metrics = feed.metrics();
    info!(
        total_updates = metrics.total_updates,
        failed_updates = metrics.failed_updates,
        publish_failures = metrics.publish_failures,
        persistence_failures = metrics.persistence_failures,
        "PriceFeed stopped"
    );
    Ok(())
}

fn build_feed(config: &AppConfig) -> Result<Arc<PriceFeed>> {
    let policy = PolicyHandle::new(config.update_policy()?)?;

    let sources: Vec<Arc<dyn QuoteSource>> = config
        .sources
        .simulated_or_default()
        .into_iter()
        .map(|cfg| Arc::new(SimulatedSource::new(cfg)) as Arc<dyn QuoteSource>)
        .collect();

    let store: Arc<dyn PriceStore> = if config.persistence.csv_enabled {
        Arc::new(
            CsvPriceStore::new(&config.persistence.data_dir)
                .context("Failed to open CSV price store")?,
        )
    } else {
        Arc::new(MemoryPriceStore::new())
    };

    if !config.publisher.dry_run {
        bail!("only the dry-run publisher is available; set publisher.dry_run = true");
    }
    let publisher: Arc<dyn ChainPublisher> = Arc::new(DryRunPublisher::new());

    info!(
        sources = sources.len(),
        assets = config.feed.assets.len(),
        csv = config.persistence.csv_enabled,
        "pipeline assembled"
    );

    Ok(Arc::new(PriceFeed::new(PipelineParts {
        assets: config.assets(),
        sources,
        store,
        publisher,
        policy,
        source_timeout: config.source_timeout(),
        history_retention: config.history_retention(),
        hub_capacity: config.hub.queue_capacity,
    })))
}

/// Reload configuration on SIGHUP and swap in the new policy if it validates
#[cfg(unix)]
async fn reload_on_sighup(feed: Arc<PriceFeed>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "SIGHUP handler unavailable, policy reload disabled");
            return;
        }
    };

    while hangups.recv().await.is_some() {
        let candidate = AppConfig::load().and_then(|c| c.update_policy());
        match candidate {
            Ok(policy) => {
                if let Err(e) = feed.update_policy(policy) {
                    warn!(error = %e, "reloaded policy rejected, keeping current");
                }
            }
            Err(e) => warn!(error = %format!("{:#}", e), "config reload failed, keeping current policy"),
        }
    }
}
