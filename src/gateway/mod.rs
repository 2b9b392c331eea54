//! Broker execution gateway
//!
//! Everything the engine knows about order routing lives behind the
//! [`BrokerGateway`] trait: a real REST bridge ([`http::HttpGateway`]) and an
//! in-memory simulator ([`paper::PaperGateway`]) used for dry-run and tests.

pub mod http;
pub mod paper;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// Price sign for favorable movement: +1.0 for Buy, -1.0 for Sell
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Buy => 1.0,
            Direction::Sell => -1.0,
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Buy => write!(f, "BUY"),
            Direction::Sell => write!(f, "SELL"),
        }
    }
}

/// Current bid/ask for a symbol
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
}

impl Quote {
    /// Mid price
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// Price the market would fill a close of `direction` at.
    /// A long closes at bid, a short at ask.
    pub fn close_price(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Buy => self.bid,
            Direction::Sell => self.ask,
        }
    }
}

/// One OHLC candle
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Order submission request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub direction: Direction,
    pub lot: f64,
    pub stop_price: f64,
    pub target_price: f64,
    /// Free-form tag the gateway echoes back (we use it for chain ids)
    #[serde(default)]
    pub comment: String,
}

/// Broker execution gateway contract
///
/// Implementations must be safe to share across tasks; the connection is
/// rate-limited, so callers tolerate transient rejection and retry per the
/// engine's bounded-backoff policy.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Submit a market order with attached stop and target. Returns the ticket.
    async fn place_order(&self, request: &OrderRequest) -> Result<u64>;

    /// Close an open order at market. Returns realized P&L in account currency.
    async fn close_order(&self, ticket: u64) -> Result<f64>;

    /// Live quote for a symbol
    async fn get_price(&self, symbol: &str) -> Result<Quote>;

    /// Most recent candles, oldest first
    async fn get_candles(&self, symbol: &str, timeframe_minutes: u32, count: usize)
        -> Result<Vec<Candle>>;
}
