//! Quote set validation - structural checks before any numerical work
//!
//! Individually malformed quotes (wrong asset, no source, from the future,
//! stale) are dropped; a non-positive price or an entirely stale set rejects
//! the whole cycle.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::error::CycleError;
use crate::policy::UpdatePolicy;
use crate::types::{AssetId, Quote};

/// Allowed source clock lead over ours before a quote counts as "from the future"
const MAX_CLOCK_SKEW_MS: i64 = 2_000;

pub fn validate_quotes(
    asset: &AssetId,
    quotes: Vec<Quote>,
    policy: &UpdatePolicy,
    now: DateTime<Utc>,
) -> Result<Vec<Quote>, CycleError> {
    let skew = ChronoDuration::milliseconds(MAX_CLOCK_SKEW_MS);

    let well_formed: Vec<Quote> = quotes
        .into_iter()
        .filter(|q| {
            let reason = if q.source.is_empty() {
                Some("empty source name")
            } else if &q.asset != asset {
                Some("asset mismatch")
            } else if q.observed_at > now + skew {
                Some("timestamp in the future")
            } else {
                None
            };
            if let Some(reason) = reason {
                tracing::debug!(asset = %asset, source = %q.source, reason, "quote dropped");
            }
            reason.is_none()
        })
        .collect();

    if let Some(bad) = well_formed.iter().find(|q| q.price <= Decimal::ZERO) {
        return Err(CycleError::InvalidMeasurement(format!(
            "non-positive price {} from {}",
            bad.price, bad.source
        )));
    }

    let is_fresh = |q: &Quote| q.age(now) <= policy.max_data_age;
    if !well_formed.is_empty() && !well_formed.iter().any(is_fresh) {
        return Err(CycleError::InvalidMeasurement(format!(
            "all {} quotes older than {:?}",
            well_formed.len(),
            policy.max_data_age
        )));
    }

    // One quote per source, the newest fresh one
    let mut by_source: HashMap<String, Quote> = HashMap::new();
    for quote in well_formed.into_iter().filter(is_fresh) {
        match by_source.get(&quote.source) {
            Some(existing) if existing.observed_at >= quote.observed_at => {}
            _ => {
                by_source.insert(quote.source.clone(), quote);
            }
        }
    }
    let mut fresh: Vec<Quote> = by_source.into_values().collect();
    fresh.sort_by(|a, b| a.source.cmp(&b.source));

    if fresh.len() < policy.min_source_count {
        return Err(CycleError::InsufficientSources {
            required: policy.min_source_count,
            available: fresh.len(),
        });
    }

    Ok(fresh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn quote(source: &str, price: Decimal, age_secs: i64, now: DateTime<Utc>) -> Quote {
        Quote {
            source: source.to_string(),
            asset: "BTC".into(),
            price,
            observed_at: now - ChronoDuration::seconds(age_secs),
            latency: Duration::from_millis(5),
        }
    }

    fn policy(min: usize) -> UpdatePolicy {
        UpdatePolicy {
            min_source_count: min,
            max_data_age: Duration::from_secs(60),
            ..UpdatePolicy::default()
        }
    }

    #[test]
    fn test_accepts_fresh_quotes() {
        let now = Utc::now();
        let quotes = vec![quote("b", dec!(100), 1, now), quote("a", dec!(101), 2, now)];
        let valid = validate_quotes(&"BTC".into(), quotes, &policy(2), now).unwrap();
        assert_eq!(valid.len(), 2);
        assert_eq!(valid[0].source, "a");
    }

    #[test]
    fn test_rejects_too_few() {
        let now = Utc::now();
        let quotes = vec![quote("a", dec!(100), 1, now)];
        let err = validate_quotes(&"BTC".into(), quotes, &policy(2), now).unwrap_err();
        assert_eq!(
            err,
            CycleError::InsufficientSources {
                required: 2,
                available: 1
            }
        );
    }

    #[test]
    fn test_rejects_non_positive_price() {
        let now = Utc::now();
        let quotes = vec![quote("a", dec!(100), 1, now), quote("b", dec!(0), 1, now)];
        let err = validate_quotes(&"BTC".into(), quotes, &policy(1), now).unwrap_err();
        assert!(matches!(err, CycleError::InvalidMeasurement(_)));
    }

    #[test]
    fn test_rejects_all_stale() {
        let now = Utc::now();
        let quotes = vec![quote("a", dec!(100), 120, now), quote("b", dec!(100), 90, now)];
        let err = validate_quotes(&"BTC".into(), quotes, &policy(1), now).unwrap_err();
        assert!(matches!(err, CycleError::InvalidMeasurement(_)));
    }

    #[test]
    fn test_drops_stale_future_and_foreign_quotes() {
        let now = Utc::now();
        let mut foreign = quote("c", dec!(100), 1, now);
        foreign.asset = "ETH".into();
        let quotes = vec![
            quote("a", dec!(100), 1, now),
            quote("b", dec!(100), 120, now),
            quote("d", dec!(100), -30, now),
            foreign,
        ];
        let valid = validate_quotes(&"BTC".into(), quotes, &policy(1), now).unwrap();
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].source, "a");
    }

    #[test]
    fn test_keeps_newest_quote_per_source() {
        let now = Utc::now();
        let quotes = vec![quote("a", dec!(100), 10, now), quote("a", dec!(105), 1, now)];
        let valid = validate_quotes(&"BTC".into(), quotes, &policy(1), now).unwrap();
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].price, dec!(105));
    }
}
