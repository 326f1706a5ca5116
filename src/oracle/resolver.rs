//! Outlier & consensus resolver
//!
//! Scores each quote against a robust reference (median, scaled MAD), drops
//! outliers, then folds the survivors into one weighted raw measurement with
//! a confidence score built from agreement, coverage and freshness.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use std::collections::BTreeSet;

use crate::error::CycleError;
use crate::policy::UpdatePolicy;
use crate::types::Quote;

/// MAD -> std dev for normally distributed data
const MAD_SCALE: f64 = 1.4826;
/// Mean absolute deviation -> std dev, used when MAD collapses to zero
const MEAN_AD_SCALE: f64 = 1.2533;
/// Relative dispersion at which agreement halves is 1 / AGREEMENT_SCALE (1%)
const AGREEMENT_SCALE: f64 = 100.0;
/// Latency floor for inverse-latency weighting
const MIN_LATENCY_SECS: f64 = 0.001;

/// Result of one consensus pass
#[derive(Debug, Clone)]
pub struct Consensus {
    /// Weighted average of surviving quotes
    pub measurement: f64,
    /// Median of surviving quotes
    pub reference: f64,
    /// Unweighted mean of surviving quotes
    pub mean: f64,
    /// Sample std dev of surviving quotes
    pub std_dev: f64,
    pub confidence: f64,
    pub survivors: Vec<Quote>,
    pub outlier_sources: BTreeSet<String>,
    /// Newest `observed_at` among survivors
    pub observed_at: DateTime<Utc>,
}

pub fn resolve(
    quotes: &[Quote],
    policy: &UpdatePolicy,
    total_sources: usize,
    now: DateTime<Utc>,
) -> Result<Consensus, CycleError> {
    let prices = quotes
        .iter()
        .map(|q| {
            q.price.to_f64().ok_or_else(|| {
                CycleError::InvalidMeasurement(format!(
                    "price {} from {} not representable",
                    q.price, q.source
                ))
            })
        })
        .collect::<Result<Vec<f64>, _>>()?;

    if prices.is_empty() {
        return Err(CycleError::InsufficientSources {
            required: policy.min_source_count,
            available: 0,
        });
    }

    let center = median(&prices);
    let scale = robust_scale(&prices, center);

    let mut survivors = Vec::with_capacity(quotes.len());
    let mut survivor_prices = Vec::with_capacity(quotes.len());
    let mut outlier_sources = BTreeSet::new();
    for (quote, &price) in quotes.iter().zip(&prices) {
        let z = if scale > 0.0 {
            (price - center).abs() / scale
        } else {
            0.0
        };
        if z > policy.outlier_threshold_std_devs {
            tracing::info!(
                source = %quote.source,
                asset = %quote.asset,
                price = %quote.price,
                reference = center,
                z = %format!("{:.2}", z),
                "outlier discarded"
            );
            outlier_sources.insert(quote.source.clone());
        } else {
            survivors.push(quote.clone());
            survivor_prices.push(price);
        }
    }

    if survivors.len() < policy.min_source_count {
        return Err(CycleError::InsufficientSources {
            required: policy.min_source_count,
            available: survivors.len(),
        });
    }

    let reference = median(&survivor_prices);
    let mean = survivor_prices.iter().sum::<f64>() / survivor_prices.len() as f64;
    let std_dev = sample_std_dev(&survivor_prices);
    let measurement = weighted_mean(&survivors, &survivor_prices, policy);

    let freshness = survivors
        .iter()
        .map(|q| quote_freshness(q, policy, now))
        .sum::<f64>()
        / survivors.len() as f64;
    let confidence = confidence_score(
        std_dev,
        reference,
        survivors.len(),
        total_sources,
        freshness,
    );

    let observed_at = survivors
        .iter()
        .map(|q| q.observed_at)
        .max()
        .unwrap_or(now);

    Ok(Consensus {
        measurement,
        reference,
        mean,
        std_dev,
        confidence,
        survivors,
        outlier_sources,
        observed_at,
    })
}

/// Combine agreement, coverage and freshness multiplicatively, clamped to [0, 1].
///
/// Strictly decreasing in `std_dev` (for a fixed reference) and strictly
/// increasing in `source_count` (for a fixed total) while freshness > 0.
impl Consensus {
    /// Range a published price may occupy: `k` std devs either side of the
    /// unweighted mean, collapsing to the measurement when quotes agree exactly.
    pub fn price_band(&self, k: f64) -> (f64, f64) {
        let half_width = k * self.std_dev;
        if half_width > 0.0 && half_width.is_finite() {
            (self.mean - half_width, self.mean + half_width)
        } else {
            (self.measurement, self.measurement)
        }
    }
}

pub fn confidence_score(
    std_dev: f64,
    reference: f64,
    source_count: usize,
    total_sources: usize,
    freshness: f64,
) -> f64 {
    if source_count == 0 || reference == 0.0 {
        return 0.0;
    }
    let dispersion = (std_dev / reference.abs()).max(0.0);
    let agreement = 1.0 / (1.0 + AGREEMENT_SCALE * dispersion);
    let coverage = source_count as f64 / total_sources.max(source_count) as f64;
    (agreement * coverage * freshness.clamp(0.0, 1.0)).clamp(0.0, 1.0)
}

/// 1.0 for a quote observed now, falling linearly to 0.0 at `max_data_age`
fn quote_freshness(quote: &Quote, policy: &UpdatePolicy, now: DateTime<Utc>) -> f64 {
    let age = quote.age(now).as_secs_f64();
    let max_age = policy.max_data_age.as_secs_f64();
    (1.0 - age / max_age).clamp(0.0, 1.0)
}

fn weighted_mean(quotes: &[Quote], prices: &[f64], policy: &UpdatePolicy) -> f64 {
    let mut weighted = 0.0;
    let mut total = 0.0;
    for (quote, price) in quotes.iter().zip(prices) {
        let mut weight = policy.source_weight(&quote.source);
        if policy.latency_weighting {
            weight /= quote.latency.as_secs_f64().max(MIN_LATENCY_SECS);
        }
        weighted += weight * price;
        total += weight;
    }
    if total > 0.0 {
        weighted / total
    } else {
        prices.iter().sum::<f64>() / prices.len() as f64
    }
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

pub fn sample_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    var.sqrt()
}

/// Robust std dev estimate around `center`: scaled MAD, falling back to
/// scaled mean absolute deviation when more than half the values coincide.
fn robust_scale(values: &[f64], center: f64) -> f64 {
    let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    let mad = median(&deviations);
    if mad > 0.0 {
        return MAD_SCALE * mad;
    }
    let mean_ad = deviations.iter().sum::<f64>() / deviations.len() as f64;
    MEAN_AD_SCALE * mean_ad
}
