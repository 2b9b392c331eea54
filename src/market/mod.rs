//! Market analysis helpers

pub mod trend;

pub use trend::{TrendBias, TrendScorer};
