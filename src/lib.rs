//! PriceFeed Library
//!
//! Multi-source price reconciliation: concurrent source fan-out, outlier
//! rejection, Kalman-style smoothing, alerting and live fan-out to subscribers.

pub mod alerts;
pub mod config;
pub mod driver;
pub mod error;
pub mod hub;
pub mod logging;
pub mod metrics;
pub mod oracle;
pub mod persistence;
pub mod policy;
pub mod publisher;
pub mod service;
pub mod shutdown;
pub mod types;

pub use driver::{CycleDriver, Pipeline, PipelineParts};
pub use error::{CycleError, FeedError, PolicyError};
pub use service::PriceFeed;
pub use types::{AssetId, Estimate, Quote};
