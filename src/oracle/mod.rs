//! Oracle module - multi-source price reconciliation
//!
//! Fans a request out to every quote source, validates the answers, rejects
//! outliers, and smooths the consensus through a per-asset state estimator.

pub mod estimator;
pub mod fanout;
pub mod resolver;
pub mod sources;
pub mod validator;

pub use estimator::{EstimatorState, Filtered, StateEstimator};
pub use fanout::{FetchFanout, FetchOutcome, SourceFailure};
pub use resolver::{confidence_score, resolve, Consensus};
pub use sources::{QuoteSource, SimulatedSource, SimulatedSourceConfig};
pub use validator::validate_quotes;
