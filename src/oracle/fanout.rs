//! Fetch fan-out - query every source for one asset concurrently
//!
//! Each source call runs in its own task under its own deadline, so an
//! error, a hang or a panic in one source never reaches the others.

use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::alerts::AlertManager;
use crate::error::CycleError;
use crate::logging::warn_if_slow;
use crate::metrics::MetricsCollector;
use crate::oracle::sources::QuoteSource;
use crate::shutdown::ShutdownSignal;
use crate::types::{AssetId, Quote};

/// Failure reason for fetches interrupted by shutdown; not held against the source
pub const CANCELLED: &str = "cancelled by shutdown";

/// A source that produced no quote this cycle
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFailure {
    pub source: String,
    pub reason: String,
}

/// What one source task settled on
#[derive(Debug)]
enum SourceResult {
    Fetched(Quote),
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub quotes: Vec<Quote>,
    pub failures: Vec<SourceFailure>,
}

pub struct FetchFanout {
    sources: Vec<Arc<dyn QuoteSource>>,
    timeout: Duration,
    alerts: Arc<AlertManager>,
    metrics: Arc<MetricsCollector>,
}

impl FetchFanout {
    pub fn new(
        sources: Vec<Arc<dyn QuoteSource>>,
        timeout: Duration,
        alerts: Arc<AlertManager>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            sources,
            timeout,
            alerts,
            metrics,
        }
    }

    /// Number of registered sources (the denominator of the coverage score)
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Query all sources once. Returns when every source has answered, failed,
    /// hit its deadline, or shutdown was signalled. Never retries.
    pub async fn fetch(&self, asset: &AssetId, shutdown: &ShutdownSignal) -> FetchOutcome {
        let deadline = Instant::now() + self.timeout;

        let handles: Vec<_> = self
            .sources
            .iter()
            .map(|source| {
                let source = Arc::clone(source);
                let asset = asset.clone();
                let mut shutdown = shutdown.clone();
                let slow_after = self.timeout / 2;
                tokio::spawn(async move {
                    let call = warn_if_slow(
                        "source_fetch",
                        slow_after,
                        tokio::time::timeout_at(deadline, source.get_price(&asset, deadline)),
                    );
                    tokio::select! {
                        result = call => match result {
                            Ok(Ok(quote)) => SourceResult::Fetched(quote),
                            Ok(Err(e)) => SourceResult::Failed(e.to_string()),
                            Err(_) => SourceResult::Failed("deadline exceeded".to_string()),
                        },
                        _ = shutdown.triggered() => SourceResult::Cancelled,
                    }
                })
            })
            .collect();

        let results = join_all(handles).await;

        let mut outcome = FetchOutcome::default();
        for (source, joined) in self.sources.iter().zip(results) {
            let name = source.name().to_string();
            let result = match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => SourceResult::Failed("source panicked".to_string()),
                Err(e) => SourceResult::Failed(format!("source task aborted: {}", e)),
            };

            match result {
                SourceResult::Fetched(quote) => {
                    self.metrics.record_source_success(&name);
                    outcome.quotes.push(quote);
                }
                SourceResult::Cancelled => {
                    tracing::debug!(source = %name, asset = %asset, "fetch cancelled by shutdown");
                    outcome.failures.push(SourceFailure {
                        source: name,
                        reason: CANCELLED.to_string(),
                    });
                }
                SourceResult::Failed(reason) => {
                    let error = CycleError::SourceFetch {
                        name: name.clone(),
                        reason: reason.clone(),
                    };
                    tracing::warn!(asset = %asset, error = %error, "source fetch failed");
                    self.metrics.record_source_failure(&name);
                    self.alerts.alert_data_source_failure(&name, &reason);
                    outcome.failures.push(SourceFailure {
                        source: name,
                        reason,
                    });
                }
            }
        }

        tracing::debug!(
            asset = %asset,
            ok = outcome.quotes.len(),
            failed = outcome.failures.len(),
            "fan-out complete"
        );
        outcome
    }
}
