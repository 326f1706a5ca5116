use thiserror::Error;

use crate::types::AssetId;

/// Why a single asset's cycle produced no estimate (or produced one with a caveat).
///
/// Every variant is local to one asset and one cycle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CycleError {
    #[error("source {name} failed: {reason}")]
    SourceFetch { name: String, reason: String },

    #[error("insufficient sources: {available} available, {required} required")]
    InsufficientSources { required: usize, available: usize },

    #[error("invalid measurement: {0}")]
    InvalidMeasurement(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl CycleError {
    /// Short label used as the failed-update metric key
    pub fn kind(&self) -> &'static str {
        match self {
            CycleError::SourceFetch { .. } => "source_fetch",
            CycleError::InsufficientSources { .. } => "insufficient_sources",
            CycleError::InvalidMeasurement(_) => "invalid_measurement",
            CycleError::Publish(_) => "publish",
            CycleError::Persistence(_) => "persistence",
        }
    }
}

/// Rejected policy update; the previous policy stays in force.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("{field} must be positive and finite, got {value}")]
    NotPositive { field: &'static str, value: String },

    #[error("min_source_count must be at least 1")]
    ZeroSourceCount,

    #[error("source weight for {name} must be positive and finite, got {weight}")]
    InvalidSourceWeight { name: String, weight: f64 },
}

/// Errors surfaced by the read side of the feed.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("no price found for {0}")]
    NotFound(AssetId),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}
