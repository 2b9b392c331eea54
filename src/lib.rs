//! Trade Lifecycle & Recovery Engine
//!
//! Splits every entry into a trend-trailing and a profit-trailing order,
//! watches SL/TP/manual exits for recovery re-entries, compounds booked
//! profits through a geometric pyramid, hedges drawdowns with reversible
//! shields, and gates all of it behind daily safety limits.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod market;
pub mod notify;
pub mod risk;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
